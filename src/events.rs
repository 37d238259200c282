//! Lifecycle events emitted while a nebula runs.
//!
//! Every state transition in the planner, the agent loop and the scheduler is
//! reported as one `NebulaEvent`. Observers (the CLI log printer, tests)
//! consume them through an `EventSink`.

use crate::agent::AgentRole;
use crate::gates::GateAction;
use crate::phase::PhaseId;
use crate::signals::Discovery;
use crate::tracker::DiffSummary;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NebulaEvent {
    PlanBuilt {
        name: String,
        phases: usize,
        waves: usize,
        risks: usize,
    },
    PlanHotAdded {
        phase: PhaseId,
        wave: usize,
    },
    PlanRejected {
        phase: PhaseId,
        reason: String,
    },
    PhaseStarted {
        phase: PhaseId,
    },
    PhaseDone {
        phase: PhaseId,
        cycles: u32,
        cost_usd: f64,
    },
    PhaseFailed {
        phase: PhaseId,
        error: String,
    },
    PhaseSkipped {
        phase: PhaseId,
        blocked_by: Vec<PhaseId>,
    },
    PhaseGated {
        phase: PhaseId,
        cycles_run: u32,
        cost_usd: f64,
    },
    GateResolved {
        phase: PhaseId,
        action: GateAction,
    },
    CycleStart {
        phase: PhaseId,
        cycle: u32,
        max_cycles: u32,
    },
    AgentStart {
        phase: PhaseId,
        role: AgentRole,
        cycle: u32,
    },
    AgentDone {
        phase: PhaseId,
        role: AgentRole,
        cycle: u32,
        cost_usd: f64,
        duration_ms: u64,
    },
    IssueCount {
        phase: PhaseId,
        cycle: u32,
        count: u32,
    },
    CostUpdate {
        phase: PhaseId,
        cycle_cost: f64,
        total_cost: f64,
        budget: f64,
    },
    DiscoveryPosted {
        phase: PhaseId,
        discovery: Discovery,
    },
    HailRaised {
        phase: PhaseId,
        discovery: Discovery,
        blocking: bool,
    },
    HailAnswered {
        phase: PhaseId,
        response: String,
    },
    CycleSummary {
        phase: PhaseId,
        cycle: u32,
        cost_usd: f64,
        issue_count: u32,
        approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff: Option<DiffSummary>,
    },
    SchedulerPaused,
    SchedulerResumed,
    SchedulerStopping,
    PhaseRetried {
        phase: PhaseId,
    },
    NebulaCompleted {
        done: usize,
        failed: usize,
        skipped: usize,
        total_cost_usd: f64,
    },
}

impl NebulaEvent {
    /// The phase an event concerns, if it concerns one.
    pub fn phase(&self) -> Option<&PhaseId> {
        match self {
            NebulaEvent::PlanHotAdded { phase, .. }
            | NebulaEvent::PlanRejected { phase, .. }
            | NebulaEvent::PhaseStarted { phase }
            | NebulaEvent::PhaseDone { phase, .. }
            | NebulaEvent::PhaseFailed { phase, .. }
            | NebulaEvent::PhaseSkipped { phase, .. }
            | NebulaEvent::PhaseGated { phase, .. }
            | NebulaEvent::GateResolved { phase, .. }
            | NebulaEvent::CycleStart { phase, .. }
            | NebulaEvent::AgentStart { phase, .. }
            | NebulaEvent::AgentDone { phase, .. }
            | NebulaEvent::IssueCount { phase, .. }
            | NebulaEvent::CostUpdate { phase, .. }
            | NebulaEvent::DiscoveryPosted { phase, .. }
            | NebulaEvent::HailRaised { phase, .. }
            | NebulaEvent::HailAnswered { phase, .. }
            | NebulaEvent::CycleSummary { phase, .. }
            | NebulaEvent::PhaseRetried { phase } => Some(phase),
            NebulaEvent::PlanBuilt { .. }
            | NebulaEvent::SchedulerPaused
            | NebulaEvent::SchedulerResumed
            | NebulaEvent::SchedulerStopping
            | NebulaEvent::NebulaCompleted { .. } => None,
        }
    }

    /// The snake_case variant name, as used in the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            NebulaEvent::PlanBuilt { .. } => "plan_built",
            NebulaEvent::PlanHotAdded { .. } => "plan_hot_added",
            NebulaEvent::PlanRejected { .. } => "plan_rejected",
            NebulaEvent::PhaseStarted { .. } => "phase_started",
            NebulaEvent::PhaseDone { .. } => "phase_done",
            NebulaEvent::PhaseFailed { .. } => "phase_failed",
            NebulaEvent::PhaseSkipped { .. } => "phase_skipped",
            NebulaEvent::PhaseGated { .. } => "phase_gated",
            NebulaEvent::GateResolved { .. } => "gate_resolved",
            NebulaEvent::CycleStart { .. } => "cycle_start",
            NebulaEvent::AgentStart { .. } => "agent_start",
            NebulaEvent::AgentDone { .. } => "agent_done",
            NebulaEvent::IssueCount { .. } => "issue_count",
            NebulaEvent::CostUpdate { .. } => "cost_update",
            NebulaEvent::DiscoveryPosted { .. } => "discovery_posted",
            NebulaEvent::HailRaised { .. } => "hail_raised",
            NebulaEvent::HailAnswered { .. } => "hail_answered",
            NebulaEvent::CycleSummary { .. } => "cycle_summary",
            NebulaEvent::SchedulerPaused => "scheduler_paused",
            NebulaEvent::SchedulerResumed => "scheduler_resumed",
            NebulaEvent::SchedulerStopping => "scheduler_stopping",
            NebulaEvent::PhaseRetried { .. } => "phase_retried",
            NebulaEvent::NebulaCompleted { .. } => "nebula_completed",
        }
    }
}

/// Destination for lifecycle events. Emitting never blocks or fails.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: NebulaEvent);
}

impl EventSink for mpsc::UnboundedSender<NebulaEvent> {
    fn emit(&self, event: NebulaEvent) {
        // A closed receiver just means nobody is watching anymore.
        let _ = self.send(event);
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: NebulaEvent) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<NebulaEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NebulaEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Variant names in emission order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(NebulaEvent::kind).collect()
    }

    /// Events concerning one phase, in emission order.
    pub fn for_phase(&self, phase: &str) -> Vec<NebulaEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.phase().is_some_and(|p| p.as_str() == phase))
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().iter().filter(|k| **k == kind).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: NebulaEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}
