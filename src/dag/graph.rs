//! Dependency graph over phase IDs.
//!
//! An edge `from -> to` means "`from` depends on `to`": `to` must be done
//! before `from` may start. Nodes keep their declaration order, which is used
//! as the tie-breaker everywhere an ordering choice is made.

use crate::errors::PlanError;
use crate::phase::{PhaseId, PhaseSpec};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Index into the node list.
pub(crate) type NodeIndex = usize;

/// A topological level: phases unlockable at the same dependency depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    pub number: usize,
    pub node_ids: Vec<PhaseId>,
}

/// A directed acyclic graph of phases, built incrementally.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Nodes in declaration order
    nodes: Vec<PhaseId>,
    /// Map from phase id to index
    index_map: HashMap<PhaseId, NodeIndex>,
    /// index -> nodes it depends on, in declared order
    dependencies: Vec<Vec<NodeIndex>>,
    /// index -> nodes that depend on it
    dependents: Vec<Vec<NodeIndex>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a validated graph from phase specs.
    ///
    /// Rejects duplicate IDs, undeclared dependencies and cycles, so any plan
    /// problem surfaces before a single phase executes.
    pub fn from_specs(specs: &[PhaseSpec]) -> Result<Self, PlanError> {
        let mut graph = Self::new();
        for spec in specs {
            if graph.contains(&spec.id) {
                return Err(PlanError::DuplicatePhase(spec.id.to_string()));
            }
            graph.add_node(spec.id.clone());
        }

        for spec in specs {
            for dep in &spec.depends_on {
                if !graph.contains(dep) {
                    return Err(PlanError::UnknownDependency {
                        phase: spec.id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
                graph.add_edge(&spec.id, dep)?;
            }
        }

        graph.sort()?;
        Ok(graph)
    }

    /// Add a node. Adding an existing node is a no-op, which allows
    /// incremental construction for hot-added phases.
    pub fn add_node(&mut self, id: PhaseId) -> bool {
        if self.index_map.contains_key(&id) {
            return false;
        }
        let index = self.nodes.len();
        self.index_map.insert(id.clone(), index);
        self.nodes.push(id);
        self.dependencies.push(Vec::new());
        self.dependents.push(Vec::new());
        true
    }

    /// Add an edge meaning "`from` depends on `to`". Both nodes must exist.
    pub fn add_edge(&mut self, from: &PhaseId, to: &PhaseId) -> Result<(), PlanError> {
        let from_idx = self.index_of(from)?;
        let to_idx = self.index_of(to)?;
        if !self.dependencies[from_idx].contains(&to_idx) {
            self.dependencies[from_idx].push(to_idx);
            self.dependents[to_idx].push(from_idx);
        }
        Ok(())
    }

    fn index_of(&self, id: &PhaseId) -> Result<NodeIndex, PlanError> {
        self.index_map
            .get(id)
            .copied()
            .ok_or_else(|| PlanError::UnknownNode(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &PhaseId) -> bool {
        self.index_map.contains_key(id)
    }

    /// All node IDs in declaration order.
    pub fn nodes(&self) -> &[PhaseId] {
        &self.nodes
    }

    /// Direct dependencies of a node, in declared order.
    pub fn dependencies(&self, id: &PhaseId) -> Vec<PhaseId> {
        self.index_map
            .get(id)
            .map(|&i| self.dependencies[i].iter().map(|&d| self.nodes[d].clone()).collect())
            .unwrap_or_default()
    }

    /// Nodes that directly depend on the given node.
    pub fn dependents(&self, id: &PhaseId) -> Vec<PhaseId> {
        self.index_map
            .get(id)
            .map(|&i| self.dependents[i].iter().map(|&d| self.nodes[d].clone()).collect())
            .unwrap_or_default()
    }

    /// Every transitive dependency of a node (not including the node itself).
    pub fn ancestors(&self, id: &PhaseId) -> HashSet<PhaseId> {
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let Some(&start) = self.index_map.get(id) else {
            return HashSet::new();
        };
        let mut queue: VecDeque<NodeIndex> = self.dependencies[start].iter().copied().collect();
        while let Some(node) = queue.pop_front() {
            if seen.insert(node) {
                queue.extend(self.dependencies[node].iter().copied());
            }
        }
        seen.into_iter().map(|i| self.nodes[i].clone()).collect()
    }

    /// Whether `a` and `b` are ordered by some dependency chain, in either direction.
    pub fn ordered(&self, a: &PhaseId, b: &PhaseId) -> bool {
        self.ancestors(a).contains(b) || self.ancestors(b).contains(a)
    }

    /// Kahn leveling into waves. Wave `k` holds the nodes whose dependencies
    /// all sit in waves `< k`. Errors without partial output on a cycle.
    pub fn compute_waves(&self) -> Result<Vec<Wave>, PlanError> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(|d| d.len()).collect();
        let mut current: Vec<NodeIndex> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();

        let mut waves = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            placed += current.len();
            let mut next = Vec::new();
            for &node in &current {
                for &dependent in &self.dependents[node] {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_unstable();

            waves.push(Wave {
                number: waves.len(),
                node_ids: current.iter().map(|&i| self.nodes[i].clone()).collect(),
            });
            current = next;
        }

        if placed != self.nodes.len() {
            let phases = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.nodes[i].to_string())
                .collect();
            return Err(PlanError::Cycle { phases });
        }

        Ok(waves)
    }

    /// Flat topological order. Primarily used to reject cyclic graphs.
    pub fn sort(&self) -> Result<Vec<PhaseId>, PlanError> {
        Ok(self
            .compute_waves()?
            .into_iter()
            .flat_map(|w| w.node_ids)
            .collect())
    }

    pub(crate) fn index(&self, id: &PhaseId) -> Option<NodeIndex> {
        self.index_map.get(id).copied()
    }

    pub(crate) fn dependency_indices(&self, index: NodeIndex) -> &[NodeIndex] {
        self.dependencies.get(index).map_or(&[], |v| v.as_slice())
    }

    pub(crate) fn node(&self, index: NodeIndex) -> &PhaseId {
        &self.nodes[index]
    }
}
