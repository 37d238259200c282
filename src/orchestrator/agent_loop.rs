//! The coder/reviewer cycle for a single phase.
//!
//! Each cycle runs the coder, captures what it changed (its newest commit, or
//! the working tree when it committed nothing), then runs the reviewer. The loop ends when the reviewer approves with zero issues, when
//! the cycle ceiling is reached, when the next cycle would break the budget,
//! or when an agent fails. Costs are never rolled back: an in-flight cycle
//! always finishes and its cost is recorded.

use crate::agent::{Agent, AgentRequest, AgentResponse, AgentRole};
use crate::errors::{HailError, PhaseError};
use crate::events::{EventSink, NebulaEvent};
use crate::hail::HailChannel;
use crate::phase::{PhaseId, PhaseSpec};
use crate::signals::Discovery;
use crate::tracker::{DiffSummary, capture_diff, head_commit};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Ceilings for one phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopLimits {
    pub max_cycles: u32,
    /// Non-positive means unlimited
    pub budget_usd: f64,
}

/// What happened in one completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle: u32,
    pub coder_cost: f64,
    pub reviewer_cost: f64,
    pub issue_count: u32,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffSummary>,
}

impl CycleRecord {
    pub fn cost(&self) -> f64 {
        self.coder_cost + self.reviewer_cost
    }
}

/// Mutable progress of a phase across cycles, gate retries included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopState {
    pub cycles_run: u32,
    pub cost_usd: f64,
    pub history: Vec<CycleRecord>,
    pub guidance: Vec<String>,
    pub feedback: Option<String>,
    pub last_issue_count: u32,
    pub last_diff: Option<DiffSummary>,
    pub approved: bool,
}

impl LoopState {
    /// Average cost of the cycles recorded so far.
    pub fn average_cycle_cost(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        let total: f64 = self.history.iter().map(CycleRecord::cost).sum();
        Some(total / self.history.len() as f64)
    }

    /// Prepare for another pass after a gate `Retry`: cycles restart, cost stays.
    pub fn reset_for_retry(&mut self) {
        self.cycles_run = 0;
        self.approved = false;
    }

    /// Whether another cycle fits in the budget. Non-positive budgets never stop.
    pub fn budget_allows_cycle(&self, budget_usd: f64) -> bool {
        if budget_usd <= 0.0 {
            return true;
        }
        if self.cost_usd > budget_usd {
            return false;
        }
        match self.average_cycle_cost() {
            Some(avg) => self.cost_usd + avg <= budget_usd,
            None => true,
        }
    }
}

/// Outcome of a standalone task.
#[derive(Debug)]
pub struct LoopReport {
    pub state: LoopState,
    pub result: Result<(), PhaseError>,
}

pub struct AgentLoop {
    agent: Arc<dyn Agent>,
    hails: Arc<HailChannel>,
    sink: Arc<dyn EventSink>,
    work_dir: Option<PathBuf>,
}

impl AgentLoop {
    pub fn new(agent: Arc<dyn Agent>, hails: Arc<HailChannel>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            agent,
            hails,
            sink,
            work_dir: None,
        }
    }

    /// Capture a git diff of `dir` after every coder turn.
    pub fn with_work_dir(mut self, dir: PathBuf) -> Self {
        self.work_dir = Some(dir);
        self
    }

    pub fn hails(&self) -> &Arc<HailChannel> {
        &self.hails
    }

    pub async fn run(
        &self,
        spec: &PhaseSpec,
        limits: LoopLimits,
        state: &mut LoopState,
        cancel: &CancellationToken,
    ) -> Result<(), PhaseError> {
        self.run_with_progress(spec, limits, state, cancel, |_| {})
            .await
    }

    /// Run cycles until approval or a terminal error. `on_cycle` sees the
    /// state after every completed cycle.
    pub async fn run_with_progress(
        &self,
        spec: &PhaseSpec,
        limits: LoopLimits,
        state: &mut LoopState,
        cancel: &CancellationToken,
        mut on_cycle: impl FnMut(&LoopState) + Send,
    ) -> Result<(), PhaseError> {
        let phase = &spec.id;
        loop {
            if state.cycles_run >= limits.max_cycles {
                return Err(PhaseError::MaxCycles {
                    cycles: state.cycles_run,
                });
            }
            if !state.budget_allows_cycle(limits.budget_usd) {
                tracing::info!(
                    phase = %phase,
                    spent = state.cost_usd,
                    budget = limits.budget_usd,
                    "budget would be exceeded by another cycle"
                );
                return Err(PhaseError::BudgetExceeded {
                    spent: state.cost_usd,
                    budget: limits.budget_usd,
                });
            }
            if cancel.is_cancelled() {
                return Err(PhaseError::Other(format!(
                    "stopped before cycle {}",
                    state.cycles_run + 1
                )));
            }

            let cycle = state.cycles_run + 1;
            self.sink.emit(NebulaEvent::CycleStart {
                phase: phase.clone(),
                cycle,
                max_cycles: limits.max_cycles,
            });

            let base = self.head_commit().await;
            let coder = self
                .invoke(spec, AgentRole::Coder, cycle, state, None)
                .await?;
            self.record_cost(phase, state, coder.cost_usd, limits.budget_usd);
            if let Some(discovery) = coder.discovery.clone() {
                self.handle_discovery(phase, discovery, AgentRole::Coder, cycle, state, cancel)
                    .await?;
            }

            let diff = self.capture_diff(base).await;
            let patch = diff
                .as_ref()
                .filter(|d| !d.patch.is_empty())
                .map(|d| d.patch.clone());

            let reviewer = self
                .invoke(spec, AgentRole::Reviewer, cycle, state, patch)
                .await?;
            self.record_cost(phase, state, reviewer.cost_usd, limits.budget_usd);

            let issue_count = reviewer.issue_count.unwrap_or(0);
            self.sink.emit(NebulaEvent::IssueCount {
                phase: phase.clone(),
                cycle,
                count: issue_count,
            });
            if let Some(discovery) = reviewer.discovery.clone() {
                self.handle_discovery(phase, discovery, AgentRole::Reviewer, cycle, state, cancel)
                    .await?;
            }

            let approved = reviewer.approved == Some(true) && issue_count == 0;
            state.cycles_run = cycle;
            state.last_issue_count = issue_count;
            state.last_diff = diff.clone();
            state.approved = approved;
            state.feedback = (!approved).then(|| reviewer.output.clone());
            state.history.push(CycleRecord {
                cycle,
                coder_cost: coder.cost_usd,
                reviewer_cost: reviewer.cost_usd,
                issue_count,
                approved,
                diff: diff.clone(),
            });

            self.sink.emit(NebulaEvent::CycleSummary {
                phase: phase.clone(),
                cycle,
                cost_usd: coder.cost_usd + reviewer.cost_usd,
                issue_count,
                approved,
                diff,
            });
            tracing::info!(phase = %phase, cycle, issue_count, approved, "cycle finished");
            on_cycle(state);

            if approved {
                return Ok(());
            }
        }
    }

    /// Run an ad-hoc task outside any nebula.
    pub async fn run_task(
        &self,
        description: &str,
        limits: LoopLimits,
        cancel: &CancellationToken,
    ) -> LoopReport {
        let title: String = description
            .lines()
            .next()
            .unwrap_or("task")
            .chars()
            .take(60)
            .collect();
        let spec = PhaseSpec::new("task", &title, vec![]).with_body(description);
        let mut state = LoopState::default();
        let result = self.run(&spec, limits, &mut state, cancel).await;
        LoopReport { state, result }
    }

    async fn invoke(
        &self,
        spec: &PhaseSpec,
        role: AgentRole,
        cycle: u32,
        state: &LoopState,
        diff: Option<String>,
    ) -> Result<AgentResponse, PhaseError> {
        let request = AgentRequest {
            phase_id: spec.id.clone(),
            title: spec.title.clone(),
            role,
            cycle,
            body: spec.body.clone(),
            feedback: match role {
                AgentRole::Coder => state.feedback.clone(),
                AgentRole::Reviewer => None,
            },
            guidance: state.guidance.clone(),
            diff,
        };

        self.sink.emit(NebulaEvent::AgentStart {
            phase: spec.id.clone(),
            role,
            cycle,
        });
        let response = self
            .agent
            .invoke(request)
            .await
            .map_err(|e| PhaseError::Agent {
                role: role.to_string(),
                cycle,
                message: e.to_string(),
            })?;
        self.sink.emit(NebulaEvent::AgentDone {
            phase: spec.id.clone(),
            role,
            cycle,
            cost_usd: response.cost_usd,
            duration_ms: response.duration_ms,
        });
        Ok(response)
    }

    async fn head_commit(&self) -> Option<git2::Oid> {
        let dir = self.work_dir.clone()?;
        tokio::task::spawn_blocking(move || head_commit(&dir))
            .await
            .ok()
            .flatten()
    }

    async fn capture_diff(&self, base: Option<git2::Oid>) -> Option<DiffSummary> {
        let dir = self.work_dir.clone()?;
        tokio::task::spawn_blocking(move || capture_diff(&dir, base))
            .await
            .ok()
            .flatten()
    }

    fn record_cost(&self, phase: &PhaseId, state: &mut LoopState, cost: f64, budget: f64) {
        state.cost_usd += cost.max(0.0);
        self.sink.emit(NebulaEvent::CostUpdate {
            phase: phase.clone(),
            cycle_cost: cost,
            total_cost: state.cost_usd,
            budget,
        });
    }

    async fn handle_discovery(
        &self,
        phase: &PhaseId,
        discovery: Discovery,
        role: AgentRole,
        cycle: u32,
        state: &mut LoopState,
        cancel: &CancellationToken,
    ) -> Result<(), PhaseError> {
        let discovery = discovery.with_source(role, cycle);
        self.sink.emit(NebulaEvent::DiscoveryPosted {
            phase: phase.clone(),
            discovery: discovery.clone(),
        });
        if !discovery.is_blocking() {
            if discovery.kind.is_hail_worthy() {
                self.hails.hail(phase, discovery);
            }
            return Ok(());
        }

        match self.hails.hail_and_wait(cancel, phase, discovery).await {
            Ok(answer) => {
                state.guidance.push(answer);
                Ok(())
            }
            Err(HailError::Cancelled) => Err(PhaseError::HailCancelled {
                phase: phase.to_string(),
            }),
            Err(HailError::Dismissed) => Err(PhaseError::HailDismissed {
                phase: phase.to_string(),
            }),
            Err(e) => Err(PhaseError::Other(e.to_string())),
        }
    }
}
