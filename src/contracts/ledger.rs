//! Produces/consumes registry and contract evaluation.

use super::Entanglement;
use crate::dag::DependencyGraph;
use crate::phase::{PhaseId, PhaseSpec};
use crate::plan::{PlanRisk, RiskSeverity};
use serde::{Deserialize, Serialize};

/// How a consumed entanglement is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    /// Produced by the consumer itself or one of its ancestors
    Fulfilled,
    /// Produced somewhere, but with no dependency edge guaranteeing order
    Unordered,
    /// Nobody produces it
    Missing,
}

/// One consumed entanglement and the producer it resolved to, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractEntry {
    pub producer: Option<PhaseId>,
    pub consumer: PhaseId,
    pub entanglement: Entanglement,
    pub status: ContractStatus,
}

/// Contract evaluation split by outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractReport {
    pub fulfilled: Vec<ContractEntry>,
    pub unfulfilled: Vec<ContractEntry>,
}

impl ContractReport {
    pub fn total(&self) -> usize {
        self.fulfilled.len() + self.unfulfilled.len()
    }
}

/// Append-only registry of produces/consumes declarations.
///
/// Registration happens while a plan is built; afterwards the ledger is only
/// read, so sharing it across workers needs no locking.
#[derive(Debug, Clone, Default)]
pub struct ContractLedger {
    produces: Vec<(PhaseId, Entanglement)>,
    consumes: Vec<(PhaseId, Entanglement)>,
}

impl ContractLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every declaration carried by the given specs.
    pub fn from_specs(specs: &[PhaseSpec]) -> Self {
        let mut ledger = Self::new();
        for spec in specs {
            for e in &spec.produces {
                ledger.register_produces(spec.id.clone(), e.clone());
            }
            for e in &spec.consumes {
                ledger.register_consumes(spec.id.clone(), e.clone());
            }
        }
        ledger
    }

    pub fn register_produces(&mut self, phase: PhaseId, entanglement: Entanglement) {
        self.produces.push((phase, entanglement));
    }

    pub fn register_consumes(&mut self, phase: PhaseId, entanglement: Entanglement) {
        self.consumes.push((phase, entanglement));
    }

    pub fn produced(&self) -> &[(PhaseId, Entanglement)] {
        &self.produces
    }

    pub fn consumed(&self) -> &[(PhaseId, Entanglement)] {
        &self.consumes
    }

    /// Resolve every consumed entanglement against the producers.
    pub fn entries(&self, graph: &DependencyGraph) -> Vec<ContractEntry> {
        self.consumes
            .iter()
            .map(|(consumer, wanted)| {
                let producers: Vec<&PhaseId> = self
                    .produces
                    .iter()
                    .filter(|(_, e)| e.matches(wanted))
                    .map(|(p, _)| p)
                    .collect();

                let ancestors = graph.ancestors(consumer);
                let ordered = producers
                    .iter()
                    .find(|p| **p == consumer || ancestors.contains(**p));

                let (producer, status) = match (ordered, producers.first()) {
                    (Some(p), _) => (Some((*p).clone()), ContractStatus::Fulfilled),
                    (None, Some(p)) => (Some((*p).clone()), ContractStatus::Unordered),
                    (None, None) => (None, ContractStatus::Missing),
                };

                ContractEntry {
                    producer,
                    consumer: consumer.clone(),
                    entanglement: wanted.clone(),
                    status,
                }
            })
            .collect()
    }

    /// Split resolved entries into fulfilled and unfulfilled.
    pub fn report(&self, graph: &DependencyGraph) -> ContractReport {
        let (fulfilled, unfulfilled) = self
            .entries(graph)
            .into_iter()
            .partition(|e| e.status == ContractStatus::Fulfilled);
        ContractReport {
            fulfilled,
            unfulfilled,
        }
    }

    /// Advisory risks derived from the contract report.
    pub fn risks(&self, graph: &DependencyGraph) -> Vec<PlanRisk> {
        let mut risks = Vec::new();

        for entry in self.entries(graph) {
            let consumer = &entry.consumer;
            let e = &entry.entanglement;
            match (&entry.status, &entry.producer) {
                (ContractStatus::Missing, _) => risks.push(PlanRisk::new(
                    RiskSeverity::Error,
                    Some(consumer.clone()),
                    format!("{} consumes {} but no phase produces it", consumer, e),
                )),
                (ContractStatus::Unordered, Some(producer)) => risks.push(PlanRisk::new(
                    RiskSeverity::Warning,
                    Some(consumer.clone()),
                    format!(
                        "{} consumes {} from {} but does not depend on it (declared but no enforced ordering)",
                        consumer, e, producer
                    ),
                )),
                _ => {}
            }

            if let Some(producer) = &entry.producer
                && let Some(mismatch) = self.signature_mismatch(producer, e)
            {
                risks.push(PlanRisk::new(
                    RiskSeverity::Warning,
                    Some(consumer.clone()),
                    format!(
                        "{} expects {} with signature `{}` but {} declares `{}` (signature mismatch)",
                        consumer,
                        e,
                        e.signature.as_deref().unwrap_or_default(),
                        producer,
                        mismatch
                    ),
                ));
            }
        }

        for (producer, e) in &self.produces {
            let consumed = self.consumes.iter().any(|(_, c)| c.matches(e));
            if !consumed {
                risks.push(PlanRisk::new(
                    RiskSeverity::Warning,
                    Some(producer.clone()),
                    format!("{} produces {} with no downstream consumers", producer, e),
                ));
            }
        }

        risks
    }

    fn signature_mismatch(&self, producer: &PhaseId, wanted: &Entanglement) -> Option<String> {
        let expected = wanted.signature.as_deref()?;
        self.produces
            .iter()
            .filter(|(p, e)| p == producer && e.matches(wanted))
            .filter_map(|(_, e)| e.signature.as_deref())
            .find(|sig| *sig != expected)
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::EntanglementKind;

    fn api(name: &str) -> Entanglement {
        Entanglement::new(EntanglementKind::Function, name)
    }

    fn graph(specs: &[PhaseSpec]) -> DependencyGraph {
        DependencyGraph::from_specs(specs).unwrap()
    }

    #[test]
    fn test_ancestor_producer_fulfills() {
        let specs = vec![
            PhaseSpec::new("setup", "Setup", vec![]).producing(api("db::connect")),
            PhaseSpec::new("auth", "Auth", vec!["setup"]).consuming(api("db::connect")),
        ];
        let ledger = ContractLedger::from_specs(&specs);
        let report = ledger.report(&graph(&specs));

        assert_eq!(report.fulfilled.len(), 1);
        assert!(report.unfulfilled.is_empty());
        assert_eq!(report.fulfilled[0].producer, Some(PhaseId::from("setup")));
        assert!(ledger.risks(&graph(&specs)).is_empty());
    }

    #[test]
    fn test_transitive_ancestor_fulfills() {
        let specs = vec![
            PhaseSpec::new("a", "A", vec![]).producing(api("x")),
            PhaseSpec::new("b", "B", vec!["a"]),
            PhaseSpec::new("c", "C", vec!["b"]).consuming(api("x")),
        ];
        let report = ContractLedger::from_specs(&specs).report(&graph(&specs));
        assert_eq!(report.fulfilled.len(), 1);
    }

    #[test]
    fn test_missing_producer_is_single_error() {
        let specs = vec![PhaseSpec::new("auth", "Auth", vec![]).consuming(api("db::connect"))];
        let ledger = ContractLedger::from_specs(&specs);
        let risks = ledger.risks(&graph(&specs));

        let errors: Vec<_> = risks
            .iter()
            .filter(|r| r.severity == RiskSeverity::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].phase_id, Some(PhaseId::from("auth")));
        assert!(errors[0].message.contains("auth"));
        assert_eq!(ledger.report(&graph(&specs)).unfulfilled.len(), 1);
    }

    #[test]
    fn test_sibling_match_is_warning() {
        let specs = vec![
            PhaseSpec::new("setup", "Setup", vec![]),
            PhaseSpec::new("auth", "Auth", vec!["setup"]).producing(api("session")),
            PhaseSpec::new("billing", "Billing", vec!["setup"]).consuming(api("session")),
        ];
        let ledger = ContractLedger::from_specs(&specs);
        let g = graph(&specs);
        let report = ledger.report(&g);
        assert_eq!(report.unfulfilled[0].status, ContractStatus::Unordered);

        let risks = ledger.risks(&g);
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].severity, RiskSeverity::Warning);
        assert!(risks[0].message.contains("no enforced ordering"));
    }

    #[test]
    fn test_producer_without_consumers_is_single_warning() {
        let specs = vec![
            PhaseSpec::new("setup", "Setup", vec![]).producing(api("unused")),
            PhaseSpec::new("auth", "Auth", vec!["setup"]),
        ];
        let risks = ContractLedger::from_specs(&specs).risks(&graph(&specs));

        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].severity, RiskSeverity::Warning);
        assert_eq!(risks[0].phase_id, Some(PhaseId::from("setup")));
        assert!(risks[0].message.contains("no downstream consumers"));
    }

    #[test]
    fn test_kind_must_match() {
        let specs = vec![
            PhaseSpec::new("a", "A", vec![])
                .producing(Entanglement::new(EntanglementKind::Type, "User")),
            PhaseSpec::new("b", "B", vec!["a"])
                .consuming(Entanglement::new(EntanglementKind::Endpoint, "User")),
        ];
        let report = ContractLedger::from_specs(&specs).report(&graph(&specs));
        assert_eq!(report.unfulfilled[0].status, ContractStatus::Missing);
    }

    #[test]
    fn test_signature_mismatch_warning() {
        let specs = vec![
            PhaseSpec::new("a", "A", vec![]).producing(api("connect").with_signature("fn() -> Db")),
            PhaseSpec::new("b", "B", vec!["a"])
                .consuming(api("connect").with_signature("fn(&str) -> Db")),
        ];
        let ledger = ContractLedger::from_specs(&specs);
        let g = graph(&specs);
        assert_eq!(ledger.report(&g).fulfilled.len(), 1);

        let risks = ledger.risks(&g);
        assert_eq!(risks.len(), 1);
        assert!(risks[0].message.contains("signature mismatch"));
    }

    #[test]
    fn test_registrations_are_append_only() {
        let mut ledger = ContractLedger::new();
        ledger.register_produces("a".into(), api("x"));
        ledger.register_produces("a".into(), api("x"));
        assert_eq!(ledger.produced().len(), 2);
    }
}
