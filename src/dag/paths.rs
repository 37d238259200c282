//! Critical path and track assignment.
//!
//! Both walks run iteratively over the Kahn order produced by
//! `compute_waves`, so they never recurse and never see a cycle.

use super::graph::{DependencyGraph, NodeIndex};
use crate::phase::PhaseId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A parallel lane. Nodes of the same wave never share a track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: usize,
    pub node_ids: Vec<PhaseId>,
}

impl DependencyGraph {
    /// Dependency depth per node index: 0 without dependencies, otherwise
    /// one more than the deepest dependency. `None` on a cyclic graph.
    fn depths(&self) -> Option<Vec<usize>> {
        let order = self.sort().ok()?;

        let mut depth = vec![0usize; self.len()];
        for node in order.iter().filter_map(|id| self.index(id)) {
            depth[node] = self
                .dependency_indices(node)
                .iter()
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }
        Some(depth)
    }

    /// Mark every node on the single longest dependency chain.
    ///
    /// The chain ends at the first-declared node of maximum depth and is
    /// walked backwards through the deepest dependency, ties going to the
    /// dependency declared first.
    pub fn critical_path(&self) -> HashSet<PhaseId> {
        let mut path = HashSet::new();
        let Some(depth) = self.depths() else {
            return path;
        };

        let mut end: Option<NodeIndex> = None;
        for node in 0..self.len() {
            if end.is_none_or(|e| depth[node] > depth[e]) {
                end = Some(node);
            }
        }

        let mut cursor = end;
        while let Some(node) = cursor {
            path.insert(self.node(node).clone());
            let mut best: Option<NodeIndex> = None;
            for &dep in self.dependency_indices(node) {
                if best.is_none_or(|b| depth[dep] > depth[b]) {
                    best = Some(dep);
                }
            }
            cursor = best;
        }

        path
    }

    /// Assign nodes to lanes, wave by wave.
    ///
    /// A node continues the track of its deepest dependency when that track
    /// is still free in the current wave; otherwise it takes the
    /// lowest-numbered free track. Empty on a cyclic graph.
    pub fn compute_tracks(&self) -> Vec<Track> {
        let Ok(waves) = self.compute_waves() else {
            return Vec::new();
        };
        let Some(depth) = self.depths() else {
            return Vec::new();
        };

        let mut track_of: Vec<Option<usize>> = vec![None; self.len()];
        let mut tracks: Vec<Track> = Vec::new();

        for wave in &waves {
            let mut taken: HashSet<usize> = HashSet::new();
            for id in &wave.node_ids {
                let Some(node) = self.index(id) else {
                    continue;
                };

                let mut deps: Vec<NodeIndex> = self.dependency_indices(node).to_vec();
                // Stable sort keeps declaration order among equal depths.
                deps.sort_by(|a, b| depth[*b].cmp(&depth[*a]));
                let inherited = deps
                    .iter()
                    .filter_map(|&d| track_of[d])
                    .find(|t| !taken.contains(t));

                let track = inherited.unwrap_or_else(|| {
                    (0..).find(|t| !taken.contains(t)).unwrap_or(0)
                });
                taken.insert(track);
                track_of[node] = Some(track);

                while tracks.len() <= track {
                    tracks.push(Track {
                        id: tracks.len(),
                        node_ids: Vec::new(),
                    });
                }
                tracks[track].node_ids.push(id.clone());
            }
        }

        tracks
    }
}

#[cfg(test)]
mod tests {
    use crate::dag::DependencyGraph;
    use crate::phase::{PhaseId, PhaseSpec};
    use std::collections::HashSet;

    fn phase(id: &str, deps: Vec<&str>) -> PhaseSpec {
        PhaseSpec::new(id, id, deps)
    }

    fn set(v: &[&str]) -> HashSet<PhaseId> {
        v.iter().map(|s| PhaseId::from(*s)).collect()
    }

    #[test]
    fn test_critical_path_linear_chain() {
        let graph = DependencyGraph::from_specs(&[
            phase("A", vec![]),
            phase("B", vec!["A"]),
            phase("C", vec!["B"]),
        ])
        .unwrap();
        assert_eq!(graph.critical_path(), set(&["A", "B", "C"]));
    }

    #[test]
    fn test_critical_path_excludes_isolated_node() {
        let graph = DependencyGraph::from_specs(&[
            phase("A", vec![]),
            phase("B", vec!["A"]),
            phase("C", vec!["B"]),
            phase("D", vec![]),
        ])
        .unwrap();
        let path = graph.critical_path();
        assert_eq!(path, set(&["A", "B", "C"]));
        assert!(!path.contains(&PhaseId::from("D")));
    }

    #[test]
    fn test_critical_path_tie_breaks_on_first_declared_dependency() {
        // d depends on b and c, both at depth 1; b is declared first.
        let graph = DependencyGraph::from_specs(&[
            phase("a", vec![]),
            phase("b", vec!["a"]),
            phase("c", vec!["a"]),
            phase("d", vec!["b", "c"]),
        ])
        .unwrap();
        assert_eq!(graph.critical_path(), set(&["a", "b", "d"]));
    }

    #[test]
    fn test_critical_path_prefers_longer_branch() {
        let graph = DependencyGraph::from_specs(&[
            phase("root", vec![]),
            phase("short", vec!["root"]),
            phase("long1", vec!["root"]),
            phase("long2", vec!["long1"]),
            phase("join", vec!["short", "long2"]),
        ])
        .unwrap();
        assert_eq!(graph.critical_path(), set(&["root", "long1", "long2", "join"]));
    }

    #[test]
    fn test_critical_path_empty_graph() {
        assert!(DependencyGraph::new().critical_path().is_empty());
    }

    #[test]
    fn test_tracks_linear_chain_single_track() {
        let graph = DependencyGraph::from_specs(&[
            phase("a", vec![]),
            phase("b", vec!["a"]),
            phase("c", vec!["b"]),
        ])
        .unwrap();
        let tracks = graph.compute_tracks();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].node_ids.len(), 3);
    }

    #[test]
    fn test_tracks_fan_out() {
        let graph = DependencyGraph::from_specs(&[
            phase("setup", vec![]),
            phase("auth", vec!["setup"]),
            phase("billing", vec!["setup"]),
        ])
        .unwrap();
        let tracks = graph.compute_tracks();

        assert_eq!(tracks.len(), 2);
        // auth continues setup's lane, billing opens the next one.
        assert_eq!(tracks[0].node_ids, vec![PhaseId::from("setup"), PhaseId::from("auth")]);
        assert_eq!(tracks[1].node_ids, vec![PhaseId::from("billing")]);
    }

    #[test]
    fn test_tracks_never_share_within_wave() {
        let graph = DependencyGraph::from_specs(&[
            phase("a", vec![]),
            phase("b", vec![]),
            phase("c", vec!["a", "b"]),
            phase("d", vec!["a"]),
            phase("e", vec!["b"]),
        ])
        .unwrap();
        let waves = graph.compute_waves().unwrap();
        let tracks = graph.compute_tracks();

        for wave in &waves {
            let mut seen = HashSet::new();
            for id in &wave.node_ids {
                let track = tracks
                    .iter()
                    .find(|t| t.node_ids.contains(id))
                    .map(|t| t.id)
                    .unwrap();
                assert!(seen.insert(track), "two nodes of wave {} share a track", wave.number);
            }
        }
        let total: usize = tracks.iter().map(|t| t.node_ids.len()).sum();
        assert_eq!(total, 5);
    }
}
