//! One worker task per in-flight phase.
//!
//! Workers never touch scheduler state. They report through the message
//! channel and the control loop applies the changes.

use super::state::WorkerResult;
use crate::errors::PhaseError;
use crate::gates::{Checkpoint, GateAction, GateController, GateMode};
use crate::orchestrator::{AgentLoop, CycleRecord, LoopLimits, LoopState};
use crate::phase::{PhaseId, PhaseSpec};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Progress {
        phase_id: PhaseId,
        cycles_run: u32,
        cost_usd: f64,
        record: Option<CycleRecord>,
    },
    /// The phase finished its cycles and waits on a gate.
    Gated { phase_id: PhaseId },
    /// A gate answered `Retry`; cycles start over.
    Resumed { phase_id: PhaseId },
    Finished(WorkerResult),
}

#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub agent_loop: Arc<AgentLoop>,
    pub gates: Arc<GateController>,
    pub tx: mpsc::UnboundedSender<WorkerMessage>,
    pub cancel: CancellationToken,
}

pub(crate) struct WorkerJob {
    pub spec: PhaseSpec,
    pub limits: LoopLimits,
    pub gate: GateMode,
}

/// Spawn a worker. A panic inside it becomes a failed `WorkerResult`.
pub(crate) fn spawn_worker(ctx: WorkerContext, job: WorkerJob) -> JoinHandle<()> {
    tokio::spawn(async move {
        let phase_id = job.spec.id.clone();
        let result = match AssertUnwindSafe(run_worker(&ctx, job)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(phase = %phase_id, panic = %message, "worker panicked");
                WorkerResult::panicked(phase_id, &message)
            }
        };
        let _ = ctx.tx.send(WorkerMessage::Finished(result));
    })
}

async fn run_worker(ctx: &WorkerContext, job: WorkerJob) -> WorkerResult {
    let WorkerJob { spec, limits, gate } = job;
    let phase_id = spec.id.clone();
    let mut state = LoopState::default();

    loop {
        let tx = ctx.tx.clone();
        let progress_id = phase_id.clone();
        let outcome = ctx
            .agent_loop
            .run_with_progress(&spec, limits, &mut state, &ctx.cancel, move |s| {
                let _ = tx.send(WorkerMessage::Progress {
                    phase_id: progress_id.clone(),
                    cycles_run: s.cycles_run,
                    cost_usd: s.cost_usd,
                    record: s.history.last().cloned(),
                });
            })
            .await;

        if let Err(e) = outcome {
            tracing::warn!(phase = %phase_id, error = %e, "phase failed");
            return WorkerResult::failed(phase_id, &e, state.cost_usd, state.cycles_run);
        }
        if !gate.gates_phase() {
            return WorkerResult::done(phase_id, state.cost_usd, state.cycles_run);
        }

        let action = match await_gate(ctx, &spec, &state).await {
            Ok(action) => action,
            Err(e) => {
                return WorkerResult::failed(phase_id, &e, state.cost_usd, state.cycles_run);
            }
        };
        match action {
            GateAction::Accept => {
                return WorkerResult::done(phase_id, state.cost_usd, state.cycles_run);
            }
            GateAction::Reject => {
                let error = PhaseError::GateRejected {
                    phase: phase_id.to_string(),
                };
                return WorkerResult::failed(phase_id, &error, state.cost_usd, state.cycles_run);
            }
            GateAction::Skip => {
                return WorkerResult::skipped(phase_id, state.cost_usd, state.cycles_run);
            }
            GateAction::Retry => {
                tracing::info!(phase = %phase_id, spent = state.cost_usd, "gate asked for another pass");
                state.reset_for_retry();
                let _ = ctx.tx.send(WorkerMessage::Resumed {
                    phase_id: phase_id.clone(),
                });
            }
        }
    }
}

/// Open a gate for the phase and wait for the decision. Cancellation
/// dismisses the gate, which resolves to `Skip`.
async fn await_gate(
    ctx: &WorkerContext,
    spec: &PhaseSpec,
    state: &LoopState,
) -> Result<GateAction, PhaseError> {
    let checkpoint = Checkpoint {
        phase_id: spec.id.clone(),
        cycles_run: state.cycles_run,
        cost_usd: state.cost_usd,
        issue_count: state.last_issue_count,
        diff: state.last_diff.clone(),
        summary: spec.title.clone(),
    };
    let _ = ctx.tx.send(WorkerMessage::Gated {
        phase_id: spec.id.clone(),
    });
    let pending = ctx
        .gates
        .open(checkpoint)
        .map_err(|e| PhaseError::Other(e.to_string()))?;

    let action = tokio::select! {
        action = pending.wait() => action,
        _ = ctx.cancel.cancelled() => {
            ctx.gates.dismiss(&spec.id);
            GateAction::Skip
        }
    };
    Ok(action)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
