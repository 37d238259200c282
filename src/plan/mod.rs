//! Execution planning.
//!
//! `ExecutionPlanner` combines the dependency graph and the contract ledger
//! into an `ExecutionPlan`. A plan is a pure function of its phase specs, so a
//! preview built now can be applied later; hot-added phases produce a fresh
//! plan rather than mutating the current one.

mod diff;
mod risk;

pub use diff::{DependencyChange, PlanDiff, WaveChange, fingerprint};
pub use risk::{PlanRisk, RiskSeverity};

use crate::contracts::{ContractEntry, ContractLedger, ContractReport};
use crate::dag::{DependencyGraph, Track, Wave};
use crate::errors::PlanError;
use crate::gates::GateMode;
use crate::phase::{PhaseId, PhaseSpec};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Limits applied to phases that do not override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefaults {
    pub max_review_cycles: u32,
    pub max_budget_usd: f64,
    pub gate: GateMode,
}

impl Default for PhaseDefaults {
    fn default() -> Self {
        Self {
            max_review_cycles: 3,
            max_budget_usd: 5.0,
            gate: GateMode::Trust,
        }
    }
}

impl PhaseDefaults {
    pub fn max_cycles_for(&self, spec: &PhaseSpec) -> u32 {
        spec.max_review_cycles.unwrap_or(self.max_review_cycles)
    }

    pub fn budget_for(&self, spec: &PhaseSpec) -> f64 {
        spec.max_budget_usd.unwrap_or(self.max_budget_usd)
    }

    pub fn gate_for(&self, spec: &PhaseSpec) -> GateMode {
        spec.gate.unwrap_or(self.gate)
    }
}

/// Aggregate numbers shown in plan previews.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStats {
    pub total_phases: usize,
    pub total_waves: usize,
    pub total_tracks: usize,
    pub fulfilled_contracts: usize,
    pub estimated_cost: f64,
}

/// A fully analysed nebula, ready to schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub name: String,
    pub phases: Vec<PhaseSpec>,
    pub waves: Vec<Wave>,
    pub tracks: Vec<Track>,
    pub critical_path: BTreeSet<PhaseId>,
    pub contracts: Vec<ContractEntry>,
    pub report: ContractReport,
    pub risks: Vec<PlanRisk>,
    pub stats: PlanStats,
    pub defaults: PhaseDefaults,
    pub fingerprint: String,
    #[serde(skip)]
    graph: DependencyGraph,
}

impl ExecutionPlan {
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn phase(&self, id: &PhaseId) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| &p.id == id)
    }

    pub fn wave_of(&self, id: &PhaseId) -> Option<usize> {
        self.waves
            .iter()
            .find(|w| w.node_ids.contains(id))
            .map(|w| w.number)
    }

    pub fn is_critical(&self, id: &PhaseId) -> bool {
        self.critical_path.contains(id)
    }

    /// Error-severity risks block apply.
    pub fn has_blocking_risks(&self) -> bool {
        self.risks.iter().any(PlanRisk::is_blocking)
    }

    pub fn risks_at(&self, severity: RiskSeverity) -> impl Iterator<Item = &PlanRisk> {
        self.risks.iter().filter(move |r| r.severity == severity)
    }

    /// Save the plan as pretty JSON for a later apply.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize execution plan")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write plan file: {}", path.display()))?;
        Ok(())
    }

    /// Load a saved plan and rebuild its graph.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
        let mut plan: ExecutionPlan = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan JSON: {}", path.display()))?;
        plan.graph = DependencyGraph::from_specs(&plan.phases)?;
        Ok(plan)
    }

    /// Whether this plan was built from exactly these phase specs.
    pub fn matches(&self, phases: &[PhaseSpec]) -> bool {
        self.fingerprint == fingerprint(phases)
    }
}

/// Builds execution plans from phase specs.
#[derive(Debug, Clone)]
pub struct ExecutionPlanner {
    name: String,
    defaults: PhaseDefaults,
}

impl ExecutionPlanner {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            defaults: PhaseDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: PhaseDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Build a plan. Fails on cycles, unknown dependencies and duplicate IDs.
    pub fn build(&self, phases: &[PhaseSpec]) -> Result<ExecutionPlan, PlanError> {
        for spec in phases {
            validate_spec(spec)?;
        }

        let graph = DependencyGraph::from_specs(phases)?;
        let waves = graph.compute_waves()?;
        let tracks = graph.compute_tracks();
        let critical_path: BTreeSet<PhaseId> = graph.critical_path().into_iter().collect();

        let ledger = ContractLedger::from_specs(phases);
        let contracts = ledger.entries(&graph);
        let report = ledger.report(&graph);
        let mut risks = ledger.risks(&graph);

        if phases.len() >= 3 && critical_path.len() * 2 > phases.len() {
            risks.push(PlanRisk::new(
                RiskSeverity::Info,
                None,
                format!(
                    "critical path spans {} of {} phases; little room for parallelism",
                    critical_path.len(),
                    phases.len()
                ),
            ));
        }
        risks.sort_by(|a, b| b.severity.cmp(&a.severity));

        let stats = PlanStats {
            total_phases: phases.len(),
            total_waves: waves.len(),
            total_tracks: tracks.len(),
            fulfilled_contracts: report.fulfilled.len(),
            estimated_cost: phases.iter().map(|p| self.defaults.budget_for(p)).sum(),
        };

        tracing::debug!(
            nebula = %self.name,
            phases = stats.total_phases,
            waves = stats.total_waves,
            risks = risks.len(),
            "built execution plan"
        );

        Ok(ExecutionPlan {
            name: self.name.clone(),
            phases: phases.to_vec(),
            waves,
            tracks,
            critical_path,
            contracts,
            report,
            risks,
            stats,
            defaults: self.defaults.clone(),
            fingerprint: fingerprint(phases),
            graph,
        })
    }

    /// Rebuild the plan with one more phase. The current plan is untouched.
    pub fn hot_add(
        &self,
        current: &ExecutionPlan,
        spec: PhaseSpec,
    ) -> Result<ExecutionPlan, PlanError> {
        if current.phase(&spec.id).is_some() {
            return Err(PlanError::DuplicatePhase(spec.id.to_string()));
        }
        let mut phases = current.phases.clone();
        phases.push(spec);
        self.build(&phases)
    }
}

fn validate_spec(spec: &PhaseSpec) -> Result<(), PlanError> {
    let invalid = |message: &str| PlanError::InvalidPhase {
        phase: spec.id.to_string(),
        message: message.to_string(),
    };
    if spec.id.as_str().trim().is_empty() {
        return Err(invalid("empty id"));
    }
    if spec.id.as_str().starts_with('@') {
        return Err(invalid("ids starting with '@' are reserved"));
    }
    if spec.max_review_cycles == Some(0) {
        return Err(invalid("max_review_cycles must be at least 1"));
    }
    if let Some(budget) = spec.max_budget_usd
        && !(budget.is_finite() && budget >= 0.0)
    {
        return Err(invalid("max_budget_usd must be a non-negative number"));
    }
    Ok(())
}
