//! Plan preview: `nebula plan`.

use anyhow::{Context, Result};
use console::style;
use nebula::config::NebulaConfig;
use nebula::phase::PhaseId;
use nebula::plan::{ExecutionPlan, PlanDiff, RiskSeverity};

use super::super::Cli;

pub fn cmd_plan(cli: &Cli, save: bool, json: bool) -> Result<()> {
    let config = NebulaConfig::with_cli_args(cli.dir.clone(), cli.verbose, false, None)?;
    let plan = build_plan(&config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_plan(&plan);
        if let Some(saved) = load_saved_plan(&config) {
            print_diff(&PlanDiff::between(&saved, &plan));
        }
    }

    if save {
        let path = config.plan_file();
        plan.save(&path)?;
        if !json {
            println!("Saved plan to {}", path.display());
            println!();
        }
    }
    Ok(())
}

/// Load, validate and plan the phases of a nebula directory.
pub fn build_plan(config: &NebulaConfig) -> Result<ExecutionPlan> {
    for warning in config.validate() {
        eprintln!("{} {}", style("warning:").yellow(), warning);
    }

    let phases = config.load_phases()?;
    if phases.is_empty() {
        anyhow::bail!(
            "No phase files found in {}. Add *.md files with +++ front-matter.",
            config.nebula_dir.display()
        );
    }
    config
        .planner()
        .build(&phases)
        .context("Failed to build execution plan")
}

pub fn load_saved_plan(config: &NebulaConfig) -> Option<ExecutionPlan> {
    let path = config.plan_file();
    if !path.exists() {
        return None;
    }
    match ExecutionPlan::load(&path) {
        Ok(plan) => Some(plan),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable saved plan");
            None
        }
    }
}

pub fn print_plan(plan: &ExecutionPlan) {
    println!();
    println!("{} {}", style("Nebula").bold(), style(&plan.name).cyan().bold());
    println!(
        "{} phases, {} waves, {} tracks, {}/{} contracts fulfilled, budget up to ${:.2}",
        plan.stats.total_phases,
        plan.stats.total_waves,
        plan.stats.total_tracks,
        plan.stats.fulfilled_contracts,
        plan.report.total(),
        plan.stats.estimated_cost
    );
    println!();

    for wave in &plan.waves {
        println!("{}", style(format!("Wave {}", wave.number)).bold());
        for id in &wave.node_ids {
            let Some(spec) = plan.phase(id) else {
                continue;
            };
            let marker = if plan.is_critical(id) {
                style("*").red().bold().to_string()
            } else {
                " ".to_string()
            };
            let deps = if spec.depends_on.is_empty() {
                String::new()
            } else {
                style(format!(" <- {}", join_ids(&spec.depends_on)))
                    .dim()
                    .to_string()
            };
            println!(
                "  {} {:<20} {}{}",
                marker,
                style(id).cyan(),
                spec.title,
                deps
            );
        }
    }
    println!();

    if plan.tracks.len() > 1 {
        println!("{}", style("Tracks").bold());
        for track in &plan.tracks {
            let names: Vec<&str> = track.node_ids.iter().map(|d| d.as_str()).collect();
            println!("  {}: {}", track.id, names.join(" -> "));
        }
        println!();
    }

    if !plan.report.unfulfilled.is_empty() {
        println!("{}", style("Unfulfilled contracts").bold());
        for entry in &plan.report.unfulfilled {
            println!(
                "  {} consumes {} ({:?})",
                entry.consumer, entry.entanglement, entry.status
            );
        }
        println!();
    }

    if !plan.risks.is_empty() {
        println!("{}", style("Risks").bold());
        for risk in &plan.risks {
            let label = match risk.severity {
                RiskSeverity::Error => style("error").red().bold(),
                RiskSeverity::Warning => style("warning").yellow(),
                RiskSeverity::Info => style("info").dim(),
            };
            match &risk.phase_id {
                Some(id) => println!("  {:<8} [{}] {}", label, id, risk.message),
                None => println!("  {:<8} {}", label, risk.message),
            }
        }
        println!();
    }
}

fn print_diff(diff: &PlanDiff) {
    if diff.is_empty() {
        println!("{}", style("No changes since the saved plan.").dim());
        println!();
        return;
    }

    println!("{}", style("Changes since the saved plan").bold());
    for id in &diff.added {
        println!("  {} {}", style("+").green(), id);
    }
    for id in &diff.removed {
        println!("  {} {}", style("-").red(), id);
    }
    for change in &diff.dependency_changes {
        println!(
            "  ~ {} depends on [{}] (was [{}])",
            change.phase_id,
            join_ids(&change.after),
            join_ids(&change.before)
        );
    }
    for change in &diff.wave_changes {
        println!(
            "  ~ {} moves from wave {} to wave {}",
            change.phase_id, change.before, change.after
        );
    }
    println!();
}

fn join_ids(ids: &[PhaseId]) -> String {
    ids.iter().map(PhaseId::as_str).collect::<Vec<_>>().join(", ")
}
