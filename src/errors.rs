//! Typed error hierarchy for the nebula orchestrator.
//!
//! Top-level enums follow the failure scopes:
//! - `PlanError`: fatal before any phase runs (graph and plan construction)
//! - `PhaseError`: terminates a single phase, recorded in its worker result
//! - `SchedulerError`: run-level failures of the worker group itself
//!
//! `AgentError`, `GateError` and `HailError` are the narrower errors of the
//! agent boundary and the two human checkpoints.

use thiserror::Error;

/// Errors raised while building the dependency graph or execution plan.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanError {
    #[error("Cycle detected in phase dependencies. Involved phases: {phases:?}")]
    Cycle { phases: Vec<String> },

    #[error("Unknown dependency '{dependency}' in phase '{phase}': no phase with that id exists")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Duplicate phase id: {0}")]
    DuplicatePhase(String),

    #[error("Edge references unknown node '{0}'")]
    UnknownNode(String),

    #[error("Invalid phase '{phase}': {message}")]
    InvalidPhase { phase: String, message: String },
}

/// Errors that terminate a single phase. Never unwind past the worker.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PhaseError {
    #[error("Max review cycles reached ({cycles}) without approval")]
    MaxCycles { cycles: u32 },

    #[error("Budget exceeded: spent ${spent:.2} of ${budget:.2}")]
    BudgetExceeded { spent: f64, budget: f64 },

    #[error("{role} agent failed in cycle {cycle}: {message}")]
    Agent {
        role: String,
        cycle: u32,
        message: String,
    },

    #[error("Hail for phase {phase} was cancelled")]
    HailCancelled { phase: String },

    #[error("Hail for phase {phase} was dismissed without an answer")]
    HailDismissed { phase: String },

    #[error("Gate rejected phase {phase}")]
    GateRejected { phase: String },

    #[error("panic: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

/// Errors from the worker group as a whole.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Another scheduler holds the run lock at {path}")]
    LockHeld { path: std::path::PathBuf },

    #[error("Failed to prepare intervention directory {path}: {source}")]
    InterventionDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors returned by an agent invocation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    #[error("Failed to spawn agent command '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("Agent exited with status {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("Agent produced no result event")]
    NoResult,

    #[error("Agent reported an error: {0}")]
    Reported(String),

    #[error("Scripted agent has no response left for {role} in phase {phase}")]
    ScriptExhausted { phase: String, role: String },

    #[error("Agent I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Io(err.to_string())
    }
}

/// Errors from the gate controller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GateError {
    #[error("Phase {phase} already has a pending gate")]
    AlreadyPending { phase: String },

    #[error("Phase {phase} has no pending gate")]
    NotPending { phase: String },
}

/// Errors from the hail channel.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HailError {
    #[error("Phase {phase} already has a blocking hail waiting for an answer")]
    AlreadyPending { phase: String },

    #[error("Phase {phase} has no pending hail")]
    NotPending { phase: String },

    #[error("Hail was cancelled")]
    Cancelled,

    #[error("Hail was dismissed without an answer")]
    Dismissed,
}
