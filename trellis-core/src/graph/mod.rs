//! Dependency Graph
//!
//! This module implements the dependency graph between variables and the
//! scheduler that keeps it consistent.
//!
//! # Overview
//!
//! The dependency graph is a directed graph where:
//!
//! - Nodes represent variables
//! - Edges represent dependencies: if A reads B, there is an edge from B to A
//!
//! Unlike a signal graph, cycles are allowed to exist: they are user errors,
//! detected on every pass and reported on the variables involved.
//!
//! # Design Decisions
//!
//! 1. We use a centralized graph owned by a single scheduler because:
//!    - It enables topological ordering for batch updates
//!    - It simplifies cycle detection
//!    - Reachability can be recomputed for a whole module at once
//!
//! 2. The graph is indexed by variable ID for O(1) lookups.
//!
//! 3. We maintain both forward (dependencies) and reverse (dependents) edges
//!    to enable efficient traversal in both directions.

mod node;
mod scheduler;
pub mod topology;

pub use node::{Dependencies, ModuleId, Node, VariableId};
pub use scheduler::{Command, PassSummary, UpdateScheduler};
pub use topology::Topology;
