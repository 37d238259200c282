use crate::errors::PhaseError;
use crate::orchestrator::CycleRecord;
use crate::phase::{PhaseId, PhaseStatus};
use serde::{Deserialize, Serialize};

/// Run-time state of one phase. Only the scheduler's control loop writes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: PhaseStatus,
    /// Unfinished dependencies that kept this phase from running
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<PhaseId>,
    /// Cost over every attempt, retries included
    pub cost_usd: f64,
    pub cycles_run: u32,
    pub max_cycles: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<CycleRecord>,
    /// Cost of earlier attempts, the base for the current one
    #[serde(skip)]
    pub(crate) prior_cost_usd: f64,
}

impl PhaseState {
    pub fn new(max_cycles: u32) -> Self {
        Self {
            max_cycles,
            ..Default::default()
        }
    }
}

/// Final report of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub phase_id: PhaseId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub skipped: bool,
    pub cost_usd: f64,
    pub cycles_run: u32,
}

impl WorkerResult {
    pub fn done(phase_id: PhaseId, cost_usd: f64, cycles_run: u32) -> Self {
        Self {
            phase_id,
            error: None,
            skipped: false,
            cost_usd,
            cycles_run,
        }
    }

    pub fn failed(phase_id: PhaseId, error: &PhaseError, cost_usd: f64, cycles_run: u32) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::done(phase_id, cost_usd, cycles_run)
        }
    }

    pub fn skipped(phase_id: PhaseId, cost_usd: f64, cycles_run: u32) -> Self {
        Self {
            skipped: true,
            ..Self::done(phase_id, cost_usd, cycles_run)
        }
    }

    /// A worker that panicked. Cost and cycles come from its last progress report.
    pub fn panicked(phase_id: PhaseId, message: &str) -> Self {
        Self::failed(phase_id, &PhaseError::Panicked(message.to_string()), 0.0, 0)
    }

    pub fn is_done(&self) -> bool {
        self.error.is_none() && !self.skipped
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn status(&self) -> PhaseStatus {
        if self.is_failed() {
            PhaseStatus::Failed
        } else if self.skipped {
            PhaseStatus::Skipped
        } else {
            PhaseStatus::Done
        }
    }
}

/// Count done and failed results; everything else of `total` is skipped.
pub fn build_result_counts(results: &[WorkerResult], total: usize) -> (usize, usize, usize) {
    let done = results.iter().filter(|r| r.is_done()).count();
    let failed = results.iter().filter(|r| r.is_failed()).count();
    let skipped = total.saturating_sub(done + failed);
    (done, failed, skipped)
}
