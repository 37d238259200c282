//! Intervention commands and status: `nebula pause|resume|stop|retry|status`.
//!
//! These only touch the sentinel files, so they work from any shell while
//! `nebula apply` runs elsewhere.

use anyhow::{Context, Result};
use console::style;
use nebula::config::NebulaConfig;
use nebula::errors::SchedulerError;
use nebula::phase::{PhaseId, PhaseStatus};
use nebula::scheduler::InterventionDir;

use super::super::Cli;

fn intervention(cli: &Cli) -> Result<(NebulaConfig, InterventionDir)> {
    let config = NebulaConfig::with_cli_args(cli.dir.clone(), cli.verbose, false, None)?;
    let dir = InterventionDir::new(config.runtime_dir());
    Ok((config, dir))
}

pub fn cmd_pause(cli: &Cli) -> Result<()> {
    let (_, dir) = intervention(cli)?;
    dir.pause().context("Failed to write PAUSE sentinel")?;
    println!("Paused. In-flight phases keep running; nothing new is dispatched.");
    Ok(())
}

pub fn cmd_resume(cli: &Cli) -> Result<()> {
    let (_, dir) = intervention(cli)?;
    dir.resume().context("Failed to remove PAUSE sentinel")?;
    println!("Resumed.");
    Ok(())
}

pub fn cmd_stop(cli: &Cli) -> Result<()> {
    let (_, dir) = intervention(cli)?;
    dir.stop().context("Failed to write STOP sentinel")?;
    println!("Stop requested. In-flight phases finish their current cycle.");
    Ok(())
}

pub fn cmd_retry(cli: &Cli, phase: &str) -> Result<()> {
    let (config, dir) = intervention(cli)?;
    let phase = PhaseId::new(phase.trim());

    let latest = config.state_manager().latest().unwrap_or_default();
    match latest.get(&phase).map(|e| e.status) {
        Some(PhaseStatus::Failed) => {}
        Some(status) => println!(
            "{} {} is {}; the scheduler only retries failed phases",
            style("note:").yellow(),
            phase,
            status
        ),
        None => println!(
            "{} no recorded status for {}",
            style("note:").yellow(),
            phase
        ),
    }

    dir.retry(&phase).context("Failed to write RETRY sentinel")?;
    println!("Retry requested for {}.", style(&phase).cyan());
    Ok(())
}

pub fn cmd_status(cli: &Cli) -> Result<()> {
    let (config, dir) = intervention(cli)?;

    println!();
    println!("{} {}", style("Nebula").bold(), style(config.name()).cyan().bold());
    println!();

    let running = match dir.lock() {
        Ok(_lock) => false,
        Err(SchedulerError::LockHeld { .. }) => true,
        Err(e) => {
            tracing::debug!(error = %e, "could not check run lock");
            false
        }
    };
    println!("Scheduler: {}", if running { "running" } else { "idle" });
    if dir.is_paused() {
        println!("Dispatch:  {}", style("paused").yellow());
    }
    if dir.is_stopped() {
        println!("Stop:      {}", style("requested").yellow());
    }
    println!();

    let latest = config.state_manager().latest()?;
    if latest.is_empty() {
        println!("No phases have run yet.");
        println!();
        return Ok(());
    }

    println!("{:<24} {:<10} {:>6} {:>9}  Updated", "Phase", "Status", "Cycles", "Cost");
    let mut total = 0.0;
    for (id, entry) in &latest {
        total += entry.cost_usd;
        let status = match entry.status {
            PhaseStatus::Done => style(entry.status.to_string()).green(),
            PhaseStatus::Failed => style(entry.status.to_string()).red(),
            PhaseStatus::Skipped => style(entry.status.to_string()).yellow(),
            _ => style(entry.status.to_string()),
        };
        println!(
            "{:<24} {:<10} {:>6} {:>9}  {}",
            id.as_str(),
            status,
            entry.cycles,
            format!("${:.2}", entry.cost_usd),
            entry.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    println!("Total spent: ${:.2}", total);
    println!();
    Ok(())
}
