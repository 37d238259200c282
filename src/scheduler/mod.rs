//! The worker group that drives a nebula to completion.
//!
//! A single control loop owns every `PhaseState`. Each tick it polls the
//! intervention sentinels, applies hot-added phases, and dispatches ready
//! phases up to the worker limit. Workers report back over a channel, and
//! every report wakes the loop immediately.

mod intervention;
mod state;
mod worker;

pub use intervention::{InterventionDir, LOCK_FILE, PAUSE_FILE, RETRY_FILE, RunLock, STOP_FILE};
pub use state::{PhaseState, WorkerResult, build_result_counts};

use crate::errors::SchedulerError;
use crate::events::{EventSink, NebulaEvent};
use crate::gates::{GateAction, GateController, GateMode, PLAN_GATE_ID};
use crate::orchestrator::{AgentLoop, LoopLimits, StateManager};
use crate::phase::{PhaseId, PhaseSpec, PhaseStatus};
use crate::plan::{ExecutionPlan, ExecutionPlanner};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use worker::{WorkerContext, WorkerJob, WorkerMessage, spawn_worker};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum phases in flight, gated ones included
    pub max_workers: usize,
    pub tick_interval: Duration,
    pub intervention_dir: PathBuf,
    /// Replaces every phase's gate mode when set
    pub gate_override: Option<GateMode>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            tick_interval: Duration::from_millis(500),
            intervention_dir: PathBuf::from(".nebula"),
            gate_override: None,
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct NebulaResult {
    pub run_id: Uuid,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_cost_usd: f64,
    pub results: Vec<WorkerResult>,
    pub phases: BTreeMap<PhaseId, PhaseState>,
    /// A STOP sentinel or a declined plan gate ended the run early
    pub stopped: bool,
    pub duration: Duration,
}

impl NebulaResult {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && !self.stopped
    }

    pub fn status_of(&self, phase: &str) -> Option<PhaseStatus> {
        self.phases.get(&PhaseId::new(phase)).map(|s| s.status)
    }
}

/// Cloneable control surface for a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    hot_add_tx: mpsc::UnboundedSender<PhaseSpec>,
    intervention: InterventionDir,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    /// Queue a new phase. It joins the plan on the next tick.
    pub fn hot_add(&self, spec: PhaseSpec) -> Result<(), SchedulerError> {
        self.hot_add_tx
            .send(spec)
            .map_err(|_| anyhow::anyhow!("scheduler is no longer running").into())
    }

    pub fn pause(&self) -> std::io::Result<()> {
        self.intervention.pause()
    }

    pub fn resume(&self) -> std::io::Result<()> {
        self.intervention.resume()
    }

    pub fn stop(&self) -> std::io::Result<()> {
        self.intervention.stop()
    }

    pub fn retry(&self, phase: &PhaseId) -> std::io::Result<()> {
        self.intervention.retry(phase)
    }

    /// Cancel in-flight work immediately: loops end before their next cycle
    /// and open gates and hails are abandoned.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct PhaseScheduler {
    plan: ExecutionPlan,
    planner: ExecutionPlanner,
    agent_loop: Arc<AgentLoop>,
    gates: Arc<GateController>,
    sink: Arc<dyn EventSink>,
    config: SchedulerConfig,
    intervention: InterventionDir,
    state_manager: Option<StateManager>,
    hot_add_tx: mpsc::UnboundedSender<PhaseSpec>,
    hot_add_rx: mpsc::UnboundedReceiver<PhaseSpec>,
    cancel: CancellationToken,
}

impl PhaseScheduler {
    pub fn new(
        plan: ExecutionPlan,
        agent_loop: Arc<AgentLoop>,
        gates: Arc<GateController>,
        sink: Arc<dyn EventSink>,
        config: SchedulerConfig,
    ) -> Self {
        let planner = ExecutionPlanner::new(&plan.name).with_defaults(plan.defaults.clone());
        let intervention = InterventionDir::new(config.intervention_dir.clone());
        let (hot_add_tx, hot_add_rx) = mpsc::unbounded_channel();
        Self {
            plan,
            planner,
            agent_loop,
            gates,
            sink,
            config,
            intervention,
            state_manager: None,
            hot_add_tx,
            hot_add_rx,
            cancel: CancellationToken::new(),
        }
    }

    /// Record terminal statuses, and seed phases already done in an earlier run.
    pub fn with_state_manager(mut self, state_manager: StateManager) -> Self {
        self.state_manager = Some(state_manager);
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            hot_add_tx: self.hot_add_tx.clone(),
            intervention: self.intervention.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Run every phase to a terminal status.
    pub async fn run(mut self) -> Result<NebulaResult, SchedulerError> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let _lock = self.intervention.lock()?;

        tracing::info!(
            %run_id,
            nebula = %self.plan.name,
            phases = self.plan.phases.len(),
            max_workers = self.config.max_workers,
            "starting nebula"
        );
        self.sink.emit(NebulaEvent::PlanBuilt {
            name: self.plan.name.clone(),
            phases: self.plan.stats.total_phases,
            waves: self.plan.stats.total_waves,
            risks: self.plan.risks.len(),
        });

        let mut phases: BTreeMap<PhaseId, PhaseState> = self
            .plan
            .phases
            .iter()
            .map(|spec| {
                let max_cycles = self.plan.defaults.max_cycles_for(spec);
                (spec.id.clone(), PhaseState::new(max_cycles))
            })
            .collect();
        let mut results = self.seed_resumed(&mut phases);

        let plan_gate = self.config.gate_override.unwrap_or(self.plan.defaults.gate);
        if plan_gate.gates_plan() && !self.approve_plan().await? {
            tracing::warn!(%run_id, "plan was not accepted; nothing will run");
            self.skip_unreachable(&mut phases);
            if let Err(e) = self.intervention.clear_stop() {
                tracing::warn!(error = %e, "failed to remove STOP sentinel");
            }
            return Ok(self.finish(run_id, started, phases, results, true));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            agent_loop: self.agent_loop.clone(),
            gates: self.gates.clone(),
            tx,
            cancel: self.cancel.clone(),
        };

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stopped = false;
        let mut paused = false;

        loop {
            // STOP only halts dispatch. In-flight phases run to completion
            // unless the token is cancelled through the handle.
            if !stopped && (self.intervention.is_stopped() || self.cancel.is_cancelled()) {
                stopped = true;
                tracing::info!(
                    %run_id,
                    forced = self.cancel.is_cancelled(),
                    "stop requested; draining in-flight phases"
                );
                self.sink.emit(NebulaEvent::SchedulerStopping);
            }

            let now_paused = self.intervention.is_paused();
            if now_paused != paused {
                paused = now_paused;
                if paused {
                    tracing::info!(%run_id, "dispatch paused");
                    self.sink.emit(NebulaEvent::SchedulerPaused);
                } else {
                    tracing::info!(%run_id, "dispatch resumed");
                    self.sink.emit(NebulaEvent::SchedulerResumed);
                }
            }

            match self.intervention.take_retry() {
                Ok(Some(id)) => self.apply_retry(&id, &mut phases, &mut results),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "failed to read RETRY sentinel"),
            }

            while let Ok(spec) = self.hot_add_rx.try_recv() {
                self.apply_hot_add(spec, &mut phases);
            }

            let ready = self.ready_phases(&phases);
            let active = phases.values().filter(|s| s.status.is_active()).count();

            if !stopped && !paused {
                let capacity = self.config.max_workers.saturating_sub(active);
                for id in ready.iter().take(capacity) {
                    self.dispatch(id, &mut phases, &ctx);
                }
            }

            let active = phases.values().filter(|s| s.status.is_active()).count();
            if active == 0 && (stopped || self.ready_phases(&phases).is_empty()) {
                break;
            }

            tokio::select! {
                Some(msg) = rx.recv() => {
                    self.handle_message(msg, &mut phases, &mut results);
                    while let Ok(msg) = rx.try_recv() {
                        self.handle_message(msg, &mut phases, &mut results);
                    }
                }
                _ = ticker.tick() => {}
            }
        }

        self.skip_unreachable(&mut phases);
        if let Err(e) = self.intervention.clear_stop() {
            tracing::warn!(error = %e, "failed to remove STOP sentinel");
        }
        Ok(self.finish(run_id, started, phases, results, stopped))
    }

    /// Waiting phases whose dependencies are all done, in dispatch order:
    /// priority, then wave, then declaration order.
    fn ready_phases(&self, phases: &BTreeMap<PhaseId, PhaseState>) -> Vec<PhaseId> {
        let is_done = |id: &PhaseId| phases.get(id).is_some_and(|s| s.status == PhaseStatus::Done);
        let mut ready: Vec<(u8, usize, usize, PhaseId)> = self
            .plan
            .phases
            .iter()
            .enumerate()
            .filter(|(_, spec)| {
                phases
                    .get(&spec.id)
                    .is_some_and(|s| s.status == PhaseStatus::Waiting)
                    && spec.depends_on.iter().all(is_done)
            })
            .map(|(index, spec)| {
                let wave = self.plan.wave_of(&spec.id).unwrap_or(usize::MAX);
                (spec.priority, wave, index, spec.id.clone())
            })
            .collect();
        ready.sort();
        ready.into_iter().map(|(_, _, _, id)| id).collect()
    }

    fn dispatch(
        &self,
        id: &PhaseId,
        phases: &mut BTreeMap<PhaseId, PhaseState>,
        ctx: &WorkerContext,
    ) {
        let (Some(spec), Some(state)) = (self.plan.phase(id), phases.get_mut(id)) else {
            return;
        };
        let defaults = &self.plan.defaults;
        let limits = LoopLimits {
            max_cycles: defaults.max_cycles_for(spec),
            budget_usd: defaults.budget_for(spec),
        };
        let gate = self
            .config
            .gate_override
            .unwrap_or_else(|| defaults.gate_for(spec));

        state.status = PhaseStatus::Working;
        state.max_cycles = limits.max_cycles;
        state.blocked_by.clear();

        tracing::info!(
            phase = %id,
            wave = ?self.plan.wave_of(id),
            critical = self.plan.is_critical(id),
            max_cycles = limits.max_cycles,
            budget = limits.budget_usd,
            %gate,
            "dispatching phase"
        );
        self.sink.emit(NebulaEvent::PhaseStarted { phase: id.clone() });
        spawn_worker(
            ctx.clone(),
            WorkerJob {
                spec: spec.clone(),
                limits,
                gate,
            },
        );
    }

    fn handle_message(
        &self,
        msg: WorkerMessage,
        phases: &mut BTreeMap<PhaseId, PhaseState>,
        results: &mut Vec<WorkerResult>,
    ) {
        match msg {
            WorkerMessage::Progress {
                phase_id,
                cycles_run,
                cost_usd,
                record,
            } => {
                if let Some(state) = phases.get_mut(&phase_id)
                    && state.status.is_active()
                {
                    state.cycles_run = cycles_run;
                    state.cost_usd = state.prior_cost_usd + cost_usd;
                    state.history.extend(record);
                }
            }
            WorkerMessage::Gated { phase_id } => {
                if let Some(state) = phases.get_mut(&phase_id) {
                    state.status = PhaseStatus::Gate;
                }
            }
            WorkerMessage::Resumed { phase_id } => {
                if let Some(state) = phases.get_mut(&phase_id) {
                    state.status = PhaseStatus::Working;
                    state.cycles_run = 0;
                    tracing::info!(phase = %phase_id, "phase back to work after gate retry");
                    self.sink.emit(NebulaEvent::PhaseStarted { phase: phase_id });
                }
            }
            WorkerMessage::Finished(mut result) => {
                let Some(state) = phases.get_mut(&result.phase_id) else {
                    return;
                };
                state.cost_usd = state
                    .cost_usd
                    .max(state.prior_cost_usd + result.cost_usd);
                state.cycles_run = state.cycles_run.max(result.cycles_run);
                state.status = result.status();
                result.cost_usd = state.cost_usd;
                result.cycles_run = state.cycles_run;

                let phase = result.phase_id.clone();
                match (&result.error, result.skipped) {
                    (Some(error), _) => {
                        tracing::warn!(phase = %phase, %error, "phase failed");
                        self.sink.emit(NebulaEvent::PhaseFailed {
                            phase: phase.clone(),
                            error: error.clone(),
                        });
                    }
                    (None, true) => {
                        tracing::info!(phase = %phase, "phase skipped at gate");
                        self.sink.emit(NebulaEvent::PhaseSkipped {
                            phase: phase.clone(),
                            blocked_by: Vec::new(),
                        });
                    }
                    (None, false) => {
                        tracing::info!(
                            phase = %phase,
                            cycles = state.cycles_run,
                            cost = state.cost_usd,
                            "phase done"
                        );
                        self.sink.emit(NebulaEvent::PhaseDone {
                            phase: phase.clone(),
                            cycles: state.cycles_run,
                            cost_usd: state.cost_usd,
                        });
                    }
                }
                self.record(&phase, state);
                results.push(result);
            }
        }
    }

    /// RETRY sentinel: a failed phase goes back to waiting with a clean history.
    fn apply_retry(
        &self,
        id: &PhaseId,
        phases: &mut BTreeMap<PhaseId, PhaseState>,
        results: &mut Vec<WorkerResult>,
    ) {
        let Some(state) = phases.get_mut(id) else {
            tracing::warn!(phase = %id, "RETRY names an unknown phase");
            return;
        };
        if state.status != PhaseStatus::Failed {
            tracing::info!(
                phase = %id,
                status = %state.status,
                "ignoring RETRY for a phase that has not failed"
            );
            return;
        }

        state.status = PhaseStatus::Waiting;
        state.cycles_run = 0;
        state.history.clear();
        state.prior_cost_usd = state.cost_usd;
        results.retain(|r| &r.phase_id != id);

        tracing::info!(phase = %id, "phase queued for retry");
        self.sink.emit(NebulaEvent::PhaseRetried { phase: id.clone() });
    }

    fn apply_hot_add(&mut self, spec: PhaseSpec, phases: &mut BTreeMap<PhaseId, PhaseState>) {
        let id = spec.id.clone();
        match self.planner.hot_add(&self.plan, spec) {
            Ok(plan) => {
                let max_cycles = plan
                    .phase(&id)
                    .map(|s| plan.defaults.max_cycles_for(s))
                    .unwrap_or(plan.defaults.max_review_cycles);
                let wave = plan.wave_of(&id).unwrap_or_default();
                phases.insert(id.clone(), PhaseState::new(max_cycles));
                self.plan = plan;

                tracing::info!(phase = %id, wave, "phase hot-added");
                self.sink.emit(NebulaEvent::PlanHotAdded { phase: id, wave });
            }
            Err(e) => {
                tracing::warn!(phase = %id, error = %e, "rejected hot-added phase");
                self.sink.emit(NebulaEvent::PlanRejected {
                    phase: id,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Phases done in an earlier run start out done.
    fn seed_resumed(&self, phases: &mut BTreeMap<PhaseId, PhaseState>) -> Vec<WorkerResult> {
        let Some(manager) = &self.state_manager else {
            return Vec::new();
        };
        let completed = match manager.completed() {
            Ok(completed) => completed,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read resume state; starting fresh");
                return Vec::new();
            }
        };

        let mut results = Vec::new();
        for (id, entry) in completed {
            let Some(state) = phases.get_mut(&id) else {
                continue;
            };
            state.status = PhaseStatus::Done;
            state.cycles_run = entry.cycles;
            state.cost_usd = entry.cost_usd;
            tracing::info!(phase = %id, "phase already done in an earlier run");
            results.push(WorkerResult::done(id, entry.cost_usd, entry.cycles));
        }
        results
    }

    /// Hold the run at the plan gate. A STOP sentinel or a cancel while
    /// waiting counts as a decline.
    async fn approve_plan(&self) -> Result<bool, SchedulerError> {
        let pending = self.gates.open_plan(&self.plan).map_err(anyhow::Error::from)?;
        let wait = pending.wait();
        tokio::pin!(wait);

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let action = loop {
            tokio::select! {
                action = &mut wait => break action,
                _ = self.cancel.cancelled() => {
                    self.gates.dismiss(&PhaseId::new(PLAN_GATE_ID));
                    break GateAction::Skip;
                }
                _ = ticker.tick() => {
                    if self.intervention.is_stopped() {
                        tracing::info!("stop requested while the plan gate was open");
                        self.gates.dismiss(&PhaseId::new(PLAN_GATE_ID));
                        self.sink.emit(NebulaEvent::SchedulerStopping);
                        break GateAction::Skip;
                    }
                }
            }
        };
        Ok(action == GateAction::Accept)
    }

    /// Every phase still waiting is skipped, blamed on its unfinished dependencies.
    fn skip_unreachable(&self, phases: &mut BTreeMap<PhaseId, PhaseState>) {
        let waiting: Vec<PhaseId> = phases
            .iter()
            .filter(|(_, s)| s.status == PhaseStatus::Waiting)
            .map(|(id, _)| id.clone())
            .collect();

        for id in waiting {
            let blocked_by: Vec<PhaseId> = self
                .plan
                .phase(&id)
                .map(|spec| {
                    spec.depends_on
                        .iter()
                        .filter(|dep| {
                            phases
                                .get(*dep)
                                .is_none_or(|s| s.status != PhaseStatus::Done)
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            if let Some(state) = phases.get_mut(&id) {
                state.status = PhaseStatus::Skipped;
                state.blocked_by = blocked_by.clone();
                tracing::info!(phase = %id, ?blocked_by, "phase skipped");
                self.record(&id, state);
            }
            self.sink.emit(NebulaEvent::PhaseSkipped {
                phase: id,
                blocked_by,
            });
        }
    }

    fn record(&self, id: &PhaseId, state: &PhaseState) {
        if let Some(manager) = &self.state_manager
            && let Err(e) = manager.save(id, state.status, state.cycles_run, state.cost_usd)
        {
            tracing::warn!(phase = %id, error = %e, "failed to record phase state");
        }
    }

    fn finish(
        &self,
        run_id: Uuid,
        started: Instant,
        phases: BTreeMap<PhaseId, PhaseState>,
        results: Vec<WorkerResult>,
        stopped: bool,
    ) -> NebulaResult {
        let (done, failed, skipped) = build_result_counts(&results, phases.len());
        let total_cost_usd = phases.values().map(|s| s.cost_usd).sum();

        tracing::info!(
            %run_id,
            done,
            failed,
            skipped,
            total_cost_usd,
            stopped,
            "nebula finished"
        );
        self.sink.emit(NebulaEvent::NebulaCompleted {
            done,
            failed,
            skipped,
            total_cost_usd,
        });

        NebulaResult {
            run_id,
            done,
            failed,
            skipped,
            total_cost_usd,
            results,
            phases,
            stopped,
            duration: started.elapsed(),
        }
    }
}
