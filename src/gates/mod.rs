//! Human checkpoints.
//!
//! A gate suspends a phase after its agent loop finishes until someone
//! accepts, rejects, retries or skips it. At most one gate is pending per
//! phase. A dismissed gate (or one whose controller goes away) resolves to
//! `Skip`, so a phase never stays in `Gate` forever.

use crate::errors::GateError;
use crate::events::{EventSink, NebulaEvent};
use crate::phase::PhaseId;
use crate::plan::ExecutionPlan;
use crate::tracker::DiffSummary;
use anyhow::Result;
use dialoguer::{Select, theme::ColorfulTheme};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Reserved id under which the plan-level gate is tracked.
pub const PLAN_GATE_ID: &str = "@plan";

/// When gates are opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateMode {
    /// Never gate
    #[default]
    Trust,
    /// Gate every phase after its loop finishes
    Review,
    /// Gate the plan before dispatch and every phase after its loop
    Approve,
}

impl GateMode {
    pub fn gates_phase(&self) -> bool {
        matches!(self, GateMode::Review | GateMode::Approve)
    }

    pub fn gates_plan(&self) -> bool {
        matches!(self, GateMode::Approve)
    }
}

impl fmt::Display for GateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateMode::Trust => write!(f, "trust"),
            GateMode::Review => write!(f, "review"),
            GateMode::Approve => write!(f, "approve"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    Accept,
    Reject,
    Retry,
    Skip,
}

impl fmt::Display for GateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateAction::Accept => write!(f, "accept"),
            GateAction::Reject => write!(f, "reject"),
            GateAction::Retry => write!(f, "retry"),
            GateAction::Skip => write!(f, "skip"),
        }
    }
}

/// What a human sees when a gate opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub phase_id: PhaseId,
    pub cycles_run: u32,
    pub cost_usd: f64,
    pub issue_count: u32,
    pub diff: Option<DiffSummary>,
    pub summary: String,
}

impl Checkpoint {
    /// Checkpoint for the plan-level gate.
    pub fn for_plan(plan: &ExecutionPlan) -> Self {
        Self {
            phase_id: PhaseId::new(PLAN_GATE_ID),
            cycles_run: 0,
            cost_usd: plan.stats.estimated_cost,
            issue_count: plan.risks.len() as u32,
            diff: None,
            summary: format!(
                "{}: {} phases in {} waves",
                plan.name, plan.stats.total_phases, plan.stats.total_waves
            ),
        }
    }

    pub fn is_plan(&self) -> bool {
        self.phase_id.as_str() == PLAN_GATE_ID
    }
}

/// A gate waiting for its decision.
#[derive(Debug)]
pub struct PendingGate {
    phase_id: PhaseId,
    rx: oneshot::Receiver<GateAction>,
}

impl PendingGate {
    pub fn phase_id(&self) -> &PhaseId {
        &self.phase_id
    }

    /// Wait for the decision. Dismissal resolves to `Skip`.
    pub async fn wait(self) -> GateAction {
        self.rx.await.unwrap_or(GateAction::Skip)
    }
}

struct OpenGate {
    checkpoint: Checkpoint,
    tx: oneshot::Sender<GateAction>,
}

/// Tracks open gates and routes decisions to them.
pub struct GateController {
    open: Mutex<BTreeMap<PhaseId, OpenGate>>,
    sink: Arc<dyn EventSink>,
}

impl GateController {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            open: Mutex::new(BTreeMap::new()),
            sink,
        }
    }

    fn gates(&self) -> std::sync::MutexGuard<'_, BTreeMap<PhaseId, OpenGate>> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a gate for the checkpoint's phase.
    pub fn open(&self, checkpoint: Checkpoint) -> Result<PendingGate, GateError> {
        let phase_id = checkpoint.phase_id.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut gates = self.gates();
            if gates.contains_key(&phase_id) {
                return Err(GateError::AlreadyPending {
                    phase: phase_id.to_string(),
                });
            }
            gates.insert(
                phase_id.clone(),
                OpenGate {
                    checkpoint: checkpoint.clone(),
                    tx,
                },
            );
        }

        tracing::info!(phase = %phase_id, cycles = checkpoint.cycles_run, "gate opened");
        self.sink.emit(NebulaEvent::PhaseGated {
            phase: phase_id.clone(),
            cycles_run: checkpoint.cycles_run,
            cost_usd: checkpoint.cost_usd,
        });
        Ok(PendingGate { phase_id, rx })
    }

    /// Open the plan-level gate.
    pub fn open_plan(&self, plan: &ExecutionPlan) -> Result<PendingGate, GateError> {
        self.open(Checkpoint::for_plan(plan))
    }

    /// Deliver a decision to a pending gate.
    pub fn resolve(&self, phase: &PhaseId, action: GateAction) -> Result<(), GateError> {
        let gate = self.gates().remove(phase).ok_or_else(|| GateError::NotPending {
            phase: phase.to_string(),
        })?;
        // The waiter may already be gone; the decision is still recorded.
        let _ = gate.tx.send(action);
        tracing::info!(phase = %phase, %action, "gate resolved");
        self.sink.emit(NebulaEvent::GateResolved {
            phase: phase.clone(),
            action,
        });
        Ok(())
    }

    /// Drop a pending gate without a decision; its waiter sees `Skip`.
    pub fn dismiss(&self, phase: &PhaseId) -> bool {
        let dismissed = self.gates().remove(phase).is_some();
        if dismissed {
            tracing::info!(phase = %phase, "gate dismissed");
        }
        dismissed
    }

    /// Dismiss every pending gate (shutdown).
    pub fn dismiss_all(&self) -> usize {
        let mut gates = self.gates();
        let count = gates.len();
        gates.clear();
        count
    }

    pub fn pending(&self) -> Vec<Checkpoint> {
        self.gates().values().map(|g| g.checkpoint.clone()).collect()
    }

    pub fn checkpoint(&self, phase: &PhaseId) -> Option<Checkpoint> {
        self.gates().get(phase).map(|g| g.checkpoint.clone())
    }
}

/// Ask the user for a gate decision on the terminal.
pub fn prompt_gate(checkpoint: &Checkpoint) -> Result<GateAction> {
    println!();
    if checkpoint.is_plan() {
        println!("  {}", console::style("Plan approval").bold());
    } else {
        println!(
            "  {} {}",
            console::style("Gate").bold(),
            console::style(&checkpoint.phase_id).cyan()
        );
        println!(
            "  {} cycles, ${:.2}, {} open issues",
            checkpoint.cycles_run, checkpoint.cost_usd, checkpoint.issue_count
        );
    }
    if !checkpoint.summary.is_empty() {
        println!("  {}", console::style(&checkpoint.summary).dim());
    }
    if let Some(diff) = &checkpoint.diff {
        println!("  changes: {}", diff.stat_line());
    }

    let options = &["Accept", "Reject", "Retry", "Skip"];
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Decision?")
        .items(options)
        .default(0)
        .interact()?;

    Ok(match selection {
        0 => GateAction::Accept,
        1 => GateAction::Reject,
        2 => GateAction::Retry,
        _ => GateAction::Skip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;

    fn checkpoint(phase: &str) -> Checkpoint {
        Checkpoint {
            phase_id: phase.into(),
            cycles_run: 2,
            cost_usd: 1.5,
            issue_count: 0,
            diff: None,
            summary: String::new(),
        }
    }

    #[tokio::test]
    async fn test_resolve_delivers_action() {
        let sink = Arc::new(RecordingSink::new());
        let gates = GateController::new(sink.clone());

        let pending = gates.open(checkpoint("auth")).unwrap();
        assert_eq!(gates.pending().len(), 1);
        gates.resolve(&"auth".into(), GateAction::Retry).unwrap();

        assert_eq!(pending.wait().await, GateAction::Retry);
        assert!(gates.pending().is_empty());
        assert_eq!(sink.kinds(), vec!["phase_gated", "gate_resolved"]);
    }

    #[tokio::test]
    async fn test_second_open_is_rejected() {
        let gates = GateController::new(Arc::new(crate::events::NullSink));
        let _first = gates.open(checkpoint("auth")).unwrap();
        let second = gates.open(checkpoint("auth"));
        assert_eq!(
            second.unwrap_err(),
            GateError::AlreadyPending {
                phase: "auth".into()
            }
        );
    }

    #[tokio::test]
    async fn test_dismiss_resolves_to_skip() {
        let gates = GateController::new(Arc::new(crate::events::NullSink));
        let pending = gates.open(checkpoint("auth")).unwrap();
        assert!(gates.dismiss(&"auth".into()));
        assert!(!gates.dismiss(&"auth".into()));
        assert_eq!(pending.wait().await, GateAction::Skip);
    }

    #[tokio::test]
    async fn test_dropped_controller_resolves_to_skip() {
        let gates = GateController::new(Arc::new(crate::events::NullSink));
        let pending = gates.open(checkpoint("auth")).unwrap();
        drop(gates);
        assert_eq!(pending.wait().await, GateAction::Skip);
    }

    #[test]
    fn test_resolve_without_gate_errors() {
        let gates = GateController::new(Arc::new(crate::events::NullSink));
        let err = gates.resolve(&"ghost".into(), GateAction::Accept);
        assert!(matches!(err, Err(GateError::NotPending { .. })));
    }

    #[test]
    fn test_gate_mode_flags() {
        assert!(!GateMode::Trust.gates_phase());
        assert!(GateMode::Review.gates_phase());
        assert!(!GateMode::Review.gates_plan());
        assert!(GateMode::Approve.gates_plan());
        let mode: GateMode = serde_json::from_str("\"review\"").unwrap();
        assert_eq!(mode, GateMode::Review);
    }

    #[test]
    fn test_gate_can_reopen_after_resolution() {
        let gates = GateController::new(Arc::new(crate::events::NullSink));
        let _p = gates.open(checkpoint("auth")).unwrap();
        gates.resolve(&"auth".into(), GateAction::Retry).unwrap();
        assert!(gates.open(checkpoint("auth")).is_ok());
    }
}
