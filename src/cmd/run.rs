//! Execution commands: `nebula apply` and `nebula task`.

use anyhow::{Result, bail};
use console::style;
use nebula::agent::ScriptedAgent;
use nebula::config::NebulaConfig;
use nebula::events::{EventSink, NebulaEvent, RecordingSink};
use nebula::gates::{GateController, GateMode};
use nebula::hail::HailChannel;
use nebula::orchestrator::{AgentLoop, LoopLimits};
use nebula::phase::PhaseStatus;
use nebula::plan::ExecutionPlan;
use nebula::scheduler::{NebulaResult, PhaseScheduler, SchedulerConfig};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::super::Cli;
use super::observer::Observer;
use super::plan::{build_plan, load_saved_plan, print_plan};

pub struct ApplyOptions {
    pub max_workers: Option<usize>,
    pub dry_run: bool,
    pub yes: bool,
    pub force: bool,
    pub fresh: bool,
}

struct Wiring {
    sink: Arc<dyn EventSink>,
    rx: mpsc::UnboundedReceiver<NebulaEvent>,
    gates: Arc<GateController>,
    agent_loop: Arc<AgentLoop>,
}

fn wire(config: &NebulaConfig) -> Wiring {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn EventSink> = Arc::new(tx);
    let hails = Arc::new(HailChannel::new(sink.clone()));
    let gates = Arc::new(GateController::new(sink.clone()));
    let agent_loop = AgentLoop::new(Arc::new(config.agent()), hails, sink.clone())
        .with_work_dir(config.working_dir());
    Wiring {
        sink,
        rx,
        gates,
        agent_loop: Arc::new(agent_loop),
    }
}

pub async fn cmd_apply(cli: &Cli, options: ApplyOptions) -> Result<()> {
    let config = NebulaConfig::with_cli_args(
        cli.dir.clone(),
        cli.verbose,
        options.yes,
        options.max_workers,
    )?;
    let plan = build_plan(&config)?;
    print_plan(&plan);

    if plan.has_blocking_risks() {
        if !options.force {
            bail!("The plan has error-level risks. Fix them or pass --force to run anyway.");
        }
        eprintln!("{} running despite error-level risks", style("warning:").yellow());
    }
    if let Some(saved) = load_saved_plan(&config)
        && !saved.matches(&plan.phases)
    {
        if !options.force {
            bail!(
                "Phase files changed since the plan was saved. Review with 'nebula plan --save' or pass --force."
            );
        }
        eprintln!("{} saved plan is stale", style("warning:").yellow());
    }
    if options.dry_run {
        let order = simulate(&config, plan).await?;
        println!(
            "Dispatch order with {} worker{}: {}",
            config.max_workers(),
            if config.max_workers() == 1 { "" } else { "s" },
            order.join(" -> ")
        );
        println!("Dry run: nothing was executed.");
        return Ok(());
    }

    let state_manager = config.state_manager();
    if options.fresh {
        state_manager.reset()?;
    }

    let Wiring {
        sink,
        rx,
        gates,
        agent_loop,
    } = wire(&config);
    let hails = agent_loop.hails().clone();
    let scheduler = PhaseScheduler::new(
        plan,
        agent_loop,
        gates.clone(),
        sink,
        config.scheduler_config(),
    )
    .with_state_manager(state_manager);

    let handle = scheduler.handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("Interrupted: stopping after in-flight work (Ctrl-C again to cancel it)");
        if let Err(e) = handle.stop() {
            tracing::warn!(error = %e, "failed to write STOP sentinel; cancelling");
            handle.cancel();
            return;
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling in-flight phases");
            handle.cancel();
        }
    });

    let done = CancellationToken::new();
    let observer = tokio::spawn(Observer::new(gates, hails, cli.verbose).run(rx, done.clone()));

    let result = scheduler.run().await;
    interrupt.abort();
    done.cancel();
    let _ = observer.await;

    let result = result?;
    print_summary(&result);
    if result.failed > 0 {
        bail!("{} phase(s) failed", result.failed);
    }
    Ok(())
}

/// Run the plan against an agent that approves everything at no cost and
/// report the order phases were dispatched in.
async fn simulate(config: &NebulaConfig, plan: ExecutionPlan) -> Result<Vec<String>> {
    let recorder = Arc::new(RecordingSink::new());
    let sink: Arc<dyn EventSink> = recorder.clone();
    let hails = Arc::new(HailChannel::new(sink.clone()));
    let agent_loop = AgentLoop::new(Arc::new(ScriptedAgent::approving()), hails, sink.clone());
    let scheduler_config = SchedulerConfig {
        intervention_dir: config.runtime_dir().join("dry-run"),
        gate_override: Some(GateMode::Trust),
        ..config.scheduler_config()
    };

    PhaseScheduler::new(
        plan,
        Arc::new(agent_loop),
        Arc::new(GateController::new(sink.clone())),
        sink,
        scheduler_config,
    )
    .run()
    .await?;

    Ok(recorder
        .events()
        .into_iter()
        .filter_map(|event| match event {
            NebulaEvent::PhaseStarted { phase } => Some(phase.to_string()),
            _ => None,
        })
        .collect())
}

fn print_summary(result: &NebulaResult) {
    println!();
    println!(
        "{} done, {} failed, {} skipped in {:.1}s, ${:.2} spent",
        style(result.done).green(),
        style(result.failed).red(),
        style(result.skipped).yellow(),
        result.duration.as_secs_f64(),
        result.total_cost_usd
    );
    for (id, state) in &result.phases {
        if state.status == PhaseStatus::Failed
            && let Some(error) = result
                .results
                .iter()
                .find(|r| &r.phase_id == id)
                .and_then(|r| r.error.as_deref())
        {
            println!("  {} {}", style(id).cyan(), error);
        }
    }
    if result.stopped {
        println!("Stopped before every phase finished. Run 'nebula apply' again to continue.");
    }
    println!();
}

pub async fn cmd_task(cli: &Cli, description: &str, max_cycles: u32, budget: f64) -> Result<()> {
    if max_cycles == 0 {
        bail!("--max-cycles must be at least 1");
    }
    let config = NebulaConfig::with_cli_args(cli.dir.clone(), cli.verbose, false, None)?;
    let Wiring {
        sink,
        rx,
        gates,
        agent_loop,
    } = wire(&config);
    drop(sink);

    let cancel = CancellationToken::new();
    let interrupt_cancel = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted: stopping before the next cycle");
            interrupt_cancel.cancel();
        }
    });

    let done = CancellationToken::new();
    let hails = agent_loop.hails().clone();
    let observer = tokio::spawn(Observer::new(gates, hails, cli.verbose).run(rx, done.clone()));

    let limits = LoopLimits {
        max_cycles,
        budget_usd: budget,
    };
    let report = agent_loop.run_task(description, limits, &cancel).await;
    interrupt.abort();
    done.cancel();
    let _ = observer.await;

    let state = &report.state;
    match report.result {
        Ok(()) => {
            println!(
                "Task approved after {} cycle{} (${:.2})",
                state.cycles_run,
                if state.cycles_run == 1 { "" } else { "s" },
                state.cost_usd
            );
            Ok(())
        }
        Err(e) => bail!(
            "Task failed after {} cycles (${:.2}): {}",
            state.cycles_run,
            state.cost_usd,
            e
        ),
    }
}
