//! Dependency graph for phase ordering.
//!
//! This module turns a set of phase specifications into an ordered,
//! parallelizable structure:
//!
//! 1. **Graph** - nodes, "depends on" edges, cycle rejection
//! 2. **Waves** - Kahn leveling; wave number is dependency depth
//! 3. **Tracks / critical path** - lanes for visualization and the longest chain
//!
//! ## Example
//!
//! ```
//! use nebula::dag::DependencyGraph;
//! use nebula::phase::PhaseSpec;
//!
//! # fn example() -> Result<(), nebula::errors::PlanError> {
//! let phases = vec![
//!     PhaseSpec::new("setup", "Setup", vec![]),
//!     PhaseSpec::new("auth", "Auth", vec!["setup"]),
//!     PhaseSpec::new("billing", "Billing", vec!["setup"]),
//! ];
//!
//! let graph = DependencyGraph::from_specs(&phases)?;
//! let waves = graph.compute_waves()?;
//! // Wave 0: [setup]
//! // Wave 1: [auth, billing]
//! assert_eq!(waves.len(), 2);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

mod graph;
mod paths;

pub use graph::{DependencyGraph, Wave};
pub use paths::Track;
