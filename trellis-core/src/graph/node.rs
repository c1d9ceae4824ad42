//! Graph Nodes
//!
//! This module defines the variable records that live in the scheduler's
//! arena, and the identifiers handles use to address them.

use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::DefinitionError;
use crate::reactive::{CellState, Definition, ProducerDriver, ProducerHandle, ValueCell};

/// Unique identifier for a variable in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(u64);

impl VariableId {
    /// Generate a new unique variable ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for VariableId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for VariableId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Unique identifier for a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(u64);

impl ModuleId {
    /// Generate a new unique module ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ModuleId {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolved dependency edges; most cells read only a handful of inputs.
pub type Dependencies = SmallVec<[VariableId; 4]>;

/// A variable in the dependency graph.
#[derive(Debug)]
pub struct Node {
    id: VariableId,
    module: ModuleId,
    name: Option<String>,

    /// Observed roots are always reachable.
    visible: bool,
    reachable: bool,

    /// Bumped by every redefinition and every invalidation.
    generation: u64,

    /// Dependency names as declared, in positional order.
    input_names: Vec<String>,

    /// Variables this node reads from, resolved from `input_names`.
    dependencies: Dependencies,

    /// Variables that read from this node.
    dependents: Vec<VariableId>,

    /// Set when some input name did not resolve (or this node's own name is
    /// claimed twice).
    resolution_error: Option<DefinitionError>,

    /// Member of a cycle, or downstream of one.
    circular: bool,

    definition: Option<Definition>,
    cell: ValueCell,
    driver: Option<ProducerDriver>,
    task: Option<JoinHandle<()>>,
}

impl Node {
    /// Create an undefined node that publishes cell states to `observer`.
    pub fn new(
        id: VariableId,
        module: ModuleId,
        visible: bool,
        observer: watch::Sender<CellState>,
    ) -> Self {
        Self {
            id,
            module,
            name: None,
            visible,
            reachable: false,
            generation: 0,
            input_names: Vec::new(),
            dependencies: Dependencies::new(),
            dependents: Vec::new(),
            resolution_error: None,
            circular: false,
            definition: None,
            cell: ValueCell::new(observer),
            driver: None,
            task: None,
        }
    }

    /// Get the node's ID.
    pub fn id(&self) -> VariableId {
        self.id
    }

    /// The module that owns this node.
    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// The node's name, if it has one.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether the node is an observed root.
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Whether the last pass found the node reachable.
    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub(crate) fn set_reachable(&mut self, reachable: bool) {
        self.reachable = reachable;
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Declared dependency names.
    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    /// Resolved dependencies.
    pub fn dependencies(&self) -> &[VariableId] {
        &self.dependencies
    }

    /// Nodes that depend on this one.
    pub fn dependents(&self) -> &[VariableId] {
        &self.dependents
    }

    /// Add a dependent (a node that reads from this node).
    pub(crate) fn add_dependent(&mut self, node_id: VariableId) {
        if !self.dependents.contains(&node_id) {
            self.dependents.push(node_id);
        }
    }

    /// Remove a dependent.
    pub(crate) fn remove_dependent(&mut self, node_id: VariableId) {
        self.dependents.retain(|id| *id != node_id);
    }

    pub fn resolution_error(&self) -> Option<&DefinitionError> {
        self.resolution_error.as_ref()
    }

    /// Replace the resolved edges. Returns the previous dependencies.
    pub(crate) fn set_resolution(
        &mut self,
        dependencies: Dependencies,
        error: Option<DefinitionError>,
    ) -> Dependencies {
        self.resolution_error = error;
        std::mem::replace(&mut self.dependencies, dependencies)
    }

    pub fn is_circular(&self) -> bool {
        self.circular
    }

    pub fn definition(&self) -> Option<&Definition> {
        self.definition.as_ref()
    }

    pub fn cell(&self) -> &ValueCell {
        &self.cell
    }

    /// Handle to the live producer, if this node is driving one.
    pub fn producer(&self) -> Option<ProducerHandle> {
        self.driver
            .as_ref()
            .filter(|driver| driver.is_active())
            .map(ProducerDriver::handle)
    }

    /// Install a new definition. Any running computation is cancelled and the
    /// cell goes pending.
    pub(crate) fn redefine(
        &mut self,
        name: Option<String>,
        input_names: Vec<String>,
        definition: Definition,
    ) {
        self.name = name;
        self.input_names = input_names;
        self.definition = Some(definition);
        self.circular = false;
        self.begin();
    }

    /// Cancel whatever is running and bind the cell to a fresh generation.
    /// Returns that generation.
    pub(crate) fn begin(&mut self) -> u64 {
        self.stop();
        self.generation += 1;
        self.cell.reset(self.generation);
        self.generation
    }

    /// Cancel whatever is running, keeping the last settled value readable.
    pub(crate) fn tear_down(&mut self) {
        self.stop();
        self.generation += 1;
        self.cell.orphan(self.generation);
    }

    /// Mark the node as part of (or downstream of) a cycle.
    pub(crate) fn mark_circular(&mut self) {
        self.circular = true;
        if self.cell.state() != &CellState::Rejected(DefinitionError::Circular) {
            let generation = self.begin();
            self.cell.settle(generation, Err(DefinitionError::Circular));
        }
    }

    /// Clear the circular flag. Returns whether it was set.
    pub(crate) fn clear_circular(&mut self) -> bool {
        std::mem::replace(&mut self.circular, false)
    }

    /// Apply a result for `generation`. Returns whether it was accepted.
    pub(crate) fn settle(
        &mut self,
        generation: u64,
        outcome: Result<serde_json::Value, DefinitionError>,
    ) -> bool {
        generation == self.generation && self.cell.settle(generation, outcome)
    }

    pub(crate) fn attach_task(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    /// The asynchronous computation for this generation has reported back.
    pub(crate) fn task_finished(&mut self) {
        self.task = None;
    }

    pub(crate) fn attach_driver(&mut self, driver: ProducerDriver) {
        self.driver = Some(driver);
    }

    /// The producer completed by itself; drop the driver without finalizing.
    pub(crate) fn driver_finished(&mut self) {
        self.driver = None;
    }

    /// Whether the node is driving a producer for its current generation.
    pub fn has_driver(&self) -> bool {
        self.driver.is_some()
    }

    /// Finalize the producer and abort any in-flight computation.
    pub(crate) fn stop(&mut self) {
        if let Some(driver) = self.driver.take() {
            if driver.stop() {
                tracing::trace!(id = ?self.id, "producer finalized");
            }
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
