//! Terminal observer for a running nebula.
//!
//! Prints one line per lifecycle event and answers gates and hails with
//! interactive prompts. Prompts run on the blocking pool, one at a time.

use console::{Emoji, style};
use nebula::events::NebulaEvent;
use nebula::gates::{GateController, prompt_gate};
use nebula::hail::{HailChannel, prompt_hail};
use nebula::phase::PhaseId;
use nebula::signals::Discovery;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR] ");
static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP] ");
static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>] ");
static GATE: Emoji<'_, '_> = Emoji("🚧 ", "[GATE] ");
static HAIL: Emoji<'_, '_> = Emoji("📣 ", "[HAIL] ");
static PAUSE: Emoji<'_, '_> = Emoji("⏸️  ", "[PAUSE] ");

pub struct Observer {
    gates: Arc<GateController>,
    hails: Arc<HailChannel>,
    interactive: bool,
    verbose: bool,
}

impl Observer {
    pub fn new(gates: Arc<GateController>, hails: Arc<HailChannel>, verbose: bool) -> Self {
        Self {
            gates,
            hails,
            interactive: console::user_attended(),
            verbose,
        }
    }

    /// Consume events until `done` fires, then flush what is left.
    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<NebulaEvent>,
        done: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = done.cancelled() => {
                    while let Ok(event) = rx.try_recv() {
                        self.print(&event);
                    }
                    break;
                }
            }
        }
    }

    async fn handle(&self, event: NebulaEvent) {
        self.print(&event);
        match event {
            NebulaEvent::PhaseGated { phase, .. } => self.answer_gate(phase).await,
            NebulaEvent::HailRaised {
                phase,
                discovery,
                blocking: true,
            } => self.answer_hail(phase, discovery).await,
            _ => {}
        }
    }

    fn print(&self, event: &NebulaEvent) {
        match event {
            NebulaEvent::PhaseStarted { phase } => {
                println!("{}{} started", RUNNING, style(phase).cyan());
            }
            NebulaEvent::CycleSummary {
                phase,
                cycle,
                cost_usd,
                issue_count,
                approved,
                diff,
            } => {
                let verdict = if *approved {
                    style("approved".to_string()).green()
                } else {
                    style(format!("{} issues", issue_count)).yellow()
                };
                let changes = diff
                    .as_ref()
                    .map(|d| format!(", {}", d.stat_line()))
                    .unwrap_or_default();
                println!(
                    "   {} cycle {}: {} (${:.2}{})",
                    style(phase).cyan(),
                    cycle,
                    verdict,
                    cost_usd,
                    changes
                );
            }
            NebulaEvent::PhaseDone {
                phase,
                cycles,
                cost_usd,
            } => {
                println!(
                    "{}{} done after {} cycle{} (${:.2})",
                    CHECK,
                    style(phase).cyan(),
                    cycles,
                    if *cycles == 1 { "" } else { "s" },
                    cost_usd
                );
            }
            NebulaEvent::PhaseFailed { phase, error } => {
                println!("{}{} failed: {}", CROSS, style(phase).cyan(), style(error).red());
            }
            NebulaEvent::PhaseSkipped { phase, blocked_by } => {
                if blocked_by.is_empty() {
                    println!("{}{} skipped", SKIP, style(phase).cyan());
                } else {
                    let names: Vec<&str> = blocked_by.iter().map(PhaseId::as_str).collect();
                    println!(
                        "{}{} skipped (blocked by {})",
                        SKIP,
                        style(phase).cyan(),
                        names.join(", ")
                    );
                }
            }
            NebulaEvent::DiscoveryPosted { phase, discovery } if !discovery.is_blocking() => {
                println!(
                    "   {} {}",
                    style(phase).cyan(),
                    style(discovery.to_string()).dim()
                );
            }
            NebulaEvent::PlanHotAdded { phase, wave } => {
                println!("   {} joined the plan in wave {}", style(phase).cyan(), wave);
            }
            NebulaEvent::PlanRejected { phase, reason } => {
                println!(
                    "{}hot-added phase {} rejected: {}",
                    CROSS,
                    style(phase).cyan(),
                    reason
                );
            }
            NebulaEvent::PhaseRetried { phase } => {
                println!("{}{} queued for retry", RUNNING, style(phase).cyan());
            }
            NebulaEvent::SchedulerPaused => println!("{}dispatch paused", PAUSE),
            NebulaEvent::SchedulerResumed => println!("{}dispatch resumed", RUNNING),
            NebulaEvent::SchedulerStopping => {
                println!("{}", style("Stopping: waiting for in-flight phases").yellow());
            }
            NebulaEvent::CycleStart {
                phase,
                cycle,
                max_cycles,
            } if self.verbose => {
                println!(
                    "   {} {}",
                    style(phase).cyan(),
                    style(format!("cycle {}/{}", cycle, max_cycles)).dim()
                );
            }
            NebulaEvent::AgentDone {
                phase,
                role,
                cost_usd,
                duration_ms,
                ..
            } if self.verbose => {
                println!(
                    "   {} {}",
                    style(phase).cyan(),
                    style(format!(
                        "{} finished in {:.1}s (${:.2})",
                        role,
                        *duration_ms as f64 / 1000.0,
                        cost_usd
                    ))
                    .dim()
                );
            }
            _ => {}
        }
    }

    async fn answer_gate(&self, phase: PhaseId) {
        let Some(checkpoint) = self.gates.checkpoint(&phase) else {
            return;
        };
        if !self.interactive {
            println!("{}{} gated with no terminal attached; skipping", GATE, phase);
            self.gates.dismiss(&phase);
            return;
        }

        match tokio::task::spawn_blocking(move || prompt_gate(&checkpoint)).await {
            Ok(Ok(action)) => {
                if let Err(e) = self.gates.resolve(&phase, action) {
                    tracing::debug!(phase = %phase, error = %e, "gate closed before the answer");
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(phase = %phase, error = %e, "gate prompt failed; skipping");
                self.gates.dismiss(&phase);
            }
            Err(e) => {
                tracing::warn!(phase = %phase, error = %e, "gate prompt task failed; skipping");
                self.gates.dismiss(&phase);
            }
        }
    }

    async fn answer_hail(&self, phase: PhaseId, discovery: Discovery) {
        if !self.interactive {
            println!(
                "{}{} needs an answer but no terminal is attached: {}",
                HAIL, phase, discovery
            );
            self.hails.dismiss(&phase);
            return;
        }

        let prompt_phase = phase.clone();
        let answer =
            tokio::task::spawn_blocking(move || prompt_hail(&prompt_phase, &discovery)).await;
        match answer {
            Ok(Ok(Some(text))) => {
                if let Err(e) = self.hails.respond(&phase, &text) {
                    tracing::debug!(phase = %phase, error = %e, "hail closed before the answer");
                }
            }
            Ok(Ok(None)) => {
                self.hails.dismiss(&phase);
            }
            Ok(Err(e)) => {
                tracing::warn!(phase = %phase, error = %e, "hail prompt failed; dismissing");
                self.hails.dismiss(&phase);
            }
            Err(e) => {
                tracing::warn!(phase = %phase, error = %e, "hail prompt task failed; dismissing");
                self.hails.dismiss(&phase);
            }
        }
    }
}
