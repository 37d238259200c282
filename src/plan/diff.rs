//! Plan fingerprints and plan-to-plan differences.
//!
//! The fingerprint lets a saved preview be applied later only if the phase
//! files have not changed in between.

use super::ExecutionPlan;
use crate::phase::{PhaseId, PhaseSpec};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// SHA-256 over the canonical JSON of the phase specs, sorted by id.
pub fn fingerprint(phases: &[PhaseSpec]) -> String {
    let mut sorted: Vec<&PhaseSpec> = phases.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut hasher = Sha256::new();
    for spec in sorted {
        // PhaseSpec serialization cannot fail: no maps with non-string keys.
        let json = serde_json::to_string(spec).unwrap_or_default();
        hasher.update(json.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// A dependency change on a phase present in both plans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyChange {
    pub phase_id: PhaseId,
    pub before: Vec<PhaseId>,
    pub after: Vec<PhaseId>,
}

/// A wave move on a phase present in both plans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveChange {
    pub phase_id: PhaseId,
    pub before: usize,
    pub after: usize,
}

/// Differences between two execution plans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDiff {
    pub added: Vec<PhaseId>,
    pub removed: Vec<PhaseId>,
    pub dependency_changes: Vec<DependencyChange>,
    pub wave_changes: Vec<WaveChange>,
}

impl PlanDiff {
    pub fn between(old: &ExecutionPlan, new: &ExecutionPlan) -> Self {
        let old_specs: BTreeMap<&PhaseId, &PhaseSpec> =
            old.phases.iter().map(|p| (&p.id, p)).collect();
        let new_specs: BTreeMap<&PhaseId, &PhaseSpec> =
            new.phases.iter().map(|p| (&p.id, p)).collect();

        let mut diff = PlanDiff::default();

        for (id, spec) in &new_specs {
            match old_specs.get(id) {
                None => diff.added.push((*id).clone()),
                Some(before) => {
                    if before.depends_on != spec.depends_on {
                        diff.dependency_changes.push(DependencyChange {
                            phase_id: (*id).clone(),
                            before: before.depends_on.clone(),
                            after: spec.depends_on.clone(),
                        });
                    }
                    if let (Some(b), Some(a)) = (old.wave_of(id), new.wave_of(id))
                        && a != b
                    {
                        diff.wave_changes.push(WaveChange {
                            phase_id: (*id).clone(),
                            before: b,
                            after: a,
                        });
                    }
                }
            }
        }

        diff.removed = old_specs
            .keys()
            .filter(|id| !new_specs.contains_key(*id))
            .map(|id| (*id).clone())
            .collect();

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.dependency_changes.is_empty()
            && self.wave_changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ExecutionPlanner;

    fn plan(specs: Vec<PhaseSpec>) -> ExecutionPlan {
        ExecutionPlanner::new("test").build(&specs).unwrap()
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = PhaseSpec::new("a", "A", vec![]);
        let b = PhaseSpec::new("b", "B", vec!["a"]);
        assert_eq!(
            fingerprint(&[a.clone(), b.clone()]),
            fingerprint(&[b.clone(), a.clone()])
        );
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let a = PhaseSpec::new("a", "A", vec![]);
        let a2 = PhaseSpec::new("a", "A", vec![]).with_body("different");
        assert_ne!(fingerprint(&[a]), fingerprint(&[a2]));
    }

    #[test]
    fn test_diff_identical_plans_is_empty() {
        let specs = vec![PhaseSpec::new("a", "A", vec![])];
        assert!(PlanDiff::between(&plan(specs.clone()), &plan(specs)).is_empty());
    }

    #[test]
    fn test_diff_detects_added_removed_and_moves() {
        let old = plan(vec![
            PhaseSpec::new("a", "A", vec![]),
            PhaseSpec::new("b", "B", vec![]),
            PhaseSpec::new("gone", "Gone", vec![]),
        ]);
        let new = plan(vec![
            PhaseSpec::new("a", "A", vec![]),
            PhaseSpec::new("b", "B", vec!["a"]),
            PhaseSpec::new("fresh", "Fresh", vec![]),
        ]);
        let diff = PlanDiff::between(&old, &new);

        assert_eq!(diff.added, vec![PhaseId::from("fresh")]);
        assert_eq!(diff.removed, vec![PhaseId::from("gone")]);
        assert_eq!(diff.dependency_changes.len(), 1);
        assert_eq!(diff.dependency_changes[0].phase_id, PhaseId::from("b"));
        assert_eq!(
            diff.wave_changes,
            vec![WaveChange {
                phase_id: PhaseId::from("b"),
                before: 0,
                after: 1
            }]
        );
    }
}
