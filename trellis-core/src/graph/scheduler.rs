//! Update Scheduler
//!
//! The scheduler owns every variable of a runtime and is the only thing that
//! ever mutates them. Handles and running computations talk to it through
//! [`Command`]s; it applies a whole batch of them and then runs one pass.
//!
//! # Algorithm
//!
//! For every module touched by the batch:
//!
//! 1. Resolve dependency names to variables. A changed resolution marks the
//!    variable for recomputation.
//! 2. Recompute reachability from the visible variables, following
//!    dependency edges downward. Variables that lost reachability are torn
//!    down (producer finalized, in-flight work orphaned). Variables that
//!    gained it are marked for recomputation.
//! 3. Find cycles. Members and everything downstream of them get the
//!    `circular definition` error without running. Variables that stopped
//!    being circular are marked for recomputation.
//!
//! Then, across all modules:
//!
//! 4. Take every marked variable that is reachable and not circular, extend
//!    the set with all eligible dependents, reset their cells, and evaluate
//!    them in topological order. Synchronous definitions settle in place, so
//!    their dependents see the new value in the same pass. Asynchronous
//!    definitions and producers report back later through the queue, which
//!    marks their dependents for the next pass.
//!
//! Every result carries the generation it was started under; anything older
//! than the variable's current generation is dropped on arrival.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{oneshot, watch};

use super::node::{Dependencies, ModuleId, Node, VariableId};
use super::topology;
use crate::config::RuntimeConfig;
use crate::error::DefinitionError;
use crate::reactive::{guarded, guarded_future, CellState, Definition, ProducerDriver};

/// A request for the scheduler. Applied in arrival order, in batches.
#[derive(Debug)]
pub enum Command {
    /// Add a new, undefined variable to a module.
    Declare {
        variable: VariableId,
        module: ModuleId,
        visible: bool,
        observer: watch::Sender<CellState>,
    },

    /// Replace a variable's name, dependencies and definition.
    Define {
        variable: VariableId,
        name: Option<String>,
        inputs: Vec<String>,
        definition: Definition,
    },

    /// Remove a variable from its module.
    Delete { variable: VariableId },

    /// An asynchronous definition finished.
    Settle {
        variable: VariableId,
        generation: u64,
        outcome: Result<Value, DefinitionError>,
    },

    /// A producer yielded.
    Produced {
        variable: VariableId,
        generation: u64,
        outcome: Result<Value, DefinitionError>,
    },

    /// A producer finished by itself.
    ProducerFinished { variable: VariableId, generation: u64 },

    /// Wake the scheduler after the last open batch closed.
    Wake,

    /// Reply once everything queued before this has been applied.
    Flush(oneshot::Sender<()>),

    /// Finalize everything and stop.
    Dispose,
}

/// How a name resolves within one module.
enum Binding {
    Unique(VariableId),
    Ambiguous,
}

/// What one pass changed. Used for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    /// Variables that became reachable.
    pub gained: usize,
    /// Variables that became unreachable.
    pub lost: usize,
    /// Variables newly marked circular.
    pub circular: usize,
    /// Variables reset and evaluated.
    pub recomputed: usize,
}

/// The update scheduler manages the dependency graph and coordinates updates.
pub struct UpdateScheduler {
    /// All variables, indexed by ID, in declaration order.
    nodes: IndexMap<VariableId, Node>,

    /// Modules whose structure may have changed since the last pass.
    dirty_modules: IndexSet<ModuleId>,

    /// Variables that must be recomputed if they are eligible.
    updated: IndexSet<VariableId>,

    /// Queue back into the scheduler, for spawned computations.
    commands: UnboundedSender<Command>,

    frame_interval: Duration,
    flushes: Vec<oneshot::Sender<()>>,
    disposed: bool,
}

impl UpdateScheduler {
    /// Create an empty scheduler. Spawned work reports back on `commands`.
    pub fn new(commands: UnboundedSender<Command>, config: &RuntimeConfig) -> Self {
        Self {
            nodes: IndexMap::new(),
            dirty_modules: IndexSet::new(),
            updated: IndexSet::new(),
            commands,
            frame_interval: config.frame_interval(),
            flushes: Vec::new(),
            disposed: false,
        }
    }

    /// Get a reference to a node.
    pub fn node(&self, id: VariableId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Get the total number of variables in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The variable of `module` holding `name`, if exactly one does.
    pub fn find(&self, module: ModuleId, name: &str) -> Option<&Node> {
        let mut matches = self
            .nodes
            .values()
            .filter(|node| node.module() == module && node.name() == Some(name));
        let first = matches.next()?;
        matches.next().is_none().then_some(first)
    }

    /// Whether the scheduler has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Flush requests collected since the last call.
    pub fn take_flushes(&mut self) -> Vec<oneshot::Sender<()>> {
        std::mem::take(&mut self.flushes)
    }

    /// Apply one command. Structural changes take effect on [`run_pass`].
    ///
    /// [`run_pass`]: UpdateScheduler::run_pass
    pub fn apply(&mut self, command: Command) {
        match command {
            Command::Flush(reply) => self.flushes.push(reply),
            _ if self.disposed => {}
            Command::Declare {
                variable,
                module,
                visible,
                observer,
            } => {
                self.nodes
                    .insert(variable, Node::new(variable, module, visible, observer));
                self.dirty_modules.insert(module);
            }
            Command::Define {
                variable,
                name,
                inputs,
                definition,
            } => {
                let Some(node) = self.nodes.get_mut(&variable) else {
                    tracing::warn!(?variable, "define on unknown variable");
                    return;
                };
                node.redefine(name, inputs, definition);
                self.dirty_modules.insert(node.module());
                self.updated.insert(variable);
            }
            Command::Delete { variable } => self.delete(variable),
            Command::Settle {
                variable,
                generation,
                outcome,
            } => {
                if let Some(node) = self.nodes.get_mut(&variable) {
                    if node.generation() == generation {
                        node.task_finished();
                    }
                }
                self.accept(variable, generation, outcome, false);
            }
            Command::Produced {
                variable,
                generation,
                outcome,
            } => self.accept(variable, generation, outcome, true),
            Command::ProducerFinished {
                variable,
                generation,
            } => {
                if let Some(node) = self.nodes.get_mut(&variable) {
                    if node.generation() == generation {
                        node.driver_finished();
                    }
                }
            }
            Command::Dispose => self.dispose(),
            Command::Wake => {}
        }
    }

    /// Deliver a result from a computation running outside the scheduler.
    fn accept(
        &mut self,
        variable: VariableId,
        generation: u64,
        outcome: Result<Value, DefinitionError>,
        from_producer: bool,
    ) {
        let Some(node) = self.nodes.get_mut(&variable) else {
            return;
        };
        // The driver may already have finished; its last values still count
        // until the node lets go of it.
        let live = node.is_reachable() && (!from_producer || node.has_driver());
        if !live || !node.settle(generation, outcome) {
            tracing::trace!(?variable, generation, "discarding stale result");
            return;
        }
        self.updated.extend(node.dependents().iter().copied());
    }

    fn delete(&mut self, variable: VariableId) {
        let Some(mut node) = self.nodes.shift_remove(&variable) else {
            return;
        };
        node.stop();
        for dependency in node.dependencies() {
            if let Some(dependency) = self.nodes.get_mut(dependency) {
                dependency.remove_dependent(variable);
            }
        }
        self.updated.shift_remove(&variable);
        self.dirty_modules.insert(node.module());
    }

    fn dispose(&mut self) {
        for node in self.nodes.values_mut() {
            node.stop();
        }
        tracing::debug!(variables = self.nodes.len(), "runtime disposed");
        self.nodes.clear();
        self.dirty_modules.clear();
        self.updated.clear();
        self.disposed = true;
    }

    /// Bring every flag and cell in line with the current graph.
    pub fn run_pass(&mut self) -> PassSummary {
        let mut summary = PassSummary::default();
        if self.disposed {
            return summary;
        }

        let modules: Vec<ModuleId> = self.dirty_modules.drain(..).collect();
        for &module in &modules {
            self.resolve(module);
            self.update_reachability(module, &mut summary);
            self.detect_cycles(module, &mut summary);
        }
        summary.recomputed = self.recompute();

        if summary != PassSummary::default() {
            tracing::debug!(
                modules = modules.len(),
                gained = summary.gained,
                lost = summary.lost,
                circular = summary.circular,
                recomputed = summary.recomputed,
                "scheduler pass"
            );
        }
        summary
    }

    fn members(&self, module: ModuleId) -> Vec<VariableId> {
        self.nodes
            .values()
            .filter(|node| node.module() == module)
            .map(Node::id)
            .collect()
    }

    /// Re-resolve every dependency name in `module`.
    fn resolve(&mut self, module: ModuleId) {
        let members = self.members(module);

        let mut names: HashMap<String, Binding> = HashMap::new();
        for id in &members {
            if let Some(name) = self.nodes.get(id).and_then(Node::name) {
                names
                    .entry(name.to_string())
                    .and_modify(|binding| *binding = Binding::Ambiguous)
                    .or_insert(Binding::Unique(*id));
            }
        }

        for id in members {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };

            let mut error = node
                .name()
                .filter(|name| matches!(names.get(*name), Some(Binding::Ambiguous)))
                .map(|name| DefinitionError::DefinedMoreThanOnce(name.to_string()));
            let mut dependencies = Dependencies::new();
            for input in node.input_names() {
                match names.get(input.as_str()) {
                    Some(Binding::Unique(target)) => dependencies.push(*target),
                    Some(Binding::Ambiguous) => {
                        error.get_or_insert_with(|| DefinitionError::DefinedMoreThanOnce(input.clone()));
                    }
                    None => {
                        error.get_or_insert_with(|| DefinitionError::NotDefined(input.clone()));
                    }
                }
            }

            if node.dependencies() == dependencies.as_slice()
                && node.resolution_error() == error.as_ref()
            {
                continue;
            }

            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            let previous = node.set_resolution(dependencies.clone(), error);
            for old in previous {
                if let Some(dependency) = self.nodes.get_mut(&old) {
                    dependency.remove_dependent(id);
                }
            }
            for new in dependencies {
                if let Some(dependency) = self.nodes.get_mut(&new) {
                    dependency.add_dependent(id);
                }
            }
            self.updated.insert(id);
        }
    }

    fn update_reachability(&mut self, module: ModuleId, summary: &mut PassSummary) {
        let members = self.members(module);
        let roots: Vec<VariableId> = members
            .iter()
            .copied()
            .filter(|id| self.nodes.get(id).is_some_and(Node::is_visible))
            .collect();
        let reached = topology::reachable(&self.nodes, roots);

        for id in members {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            let now = reached.contains(&id);
            match (node.is_reachable(), now) {
                (false, true) => {
                    summary.gained += 1;
                    self.updated.insert(id);
                }
                (true, false) => {
                    summary.lost += 1;
                    node.tear_down();
                }
                _ => {}
            }
            node.set_reachable(now);
        }
    }

    fn detect_cycles(&mut self, module: ModuleId, summary: &mut PassSummary) {
        let members = self.members(module);
        let circular = topology::circular(&self.nodes, &members);

        for id in members {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            if circular.contains(&id) {
                if !node.is_circular() {
                    summary.circular += 1;
                }
                node.mark_circular();
            } else if node.clear_circular() {
                self.updated.insert(id);
            }
        }
    }

    fn is_eligible(&self, id: VariableId) -> bool {
        self.nodes
            .get(&id)
            .is_some_and(|node| node.is_reachable() && !node.is_circular())
    }

    /// Reset and evaluate every marked variable and its eligible dependents.
    /// Returns how many were evaluated.
    fn recompute(&mut self) -> usize {
        let mut queue: VecDeque<VariableId> = self.updated.drain(..).collect();
        let mut closure: IndexSet<VariableId> = IndexSet::new();
        while let Some(id) = queue.pop_front() {
            if !self.is_eligible(id) || !closure.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                queue.extend(node.dependents().iter().copied());
            }
        }

        for id in &closure {
            if let Some(node) = self.nodes.get_mut(id) {
                node.begin();
            }
        }

        let order = topology::topological_order(&self.nodes, &closure);
        for &id in &order {
            self.evaluate(id);
        }
        order.len()
    }

    /// Collect input values. `Ok(None)` means some input is still pending.
    fn gather(&self, dependencies: &[VariableId]) -> Result<Option<Vec<Value>>, DefinitionError> {
        let mut values = Vec::with_capacity(dependencies.len());
        let mut pending = false;
        for dependency in dependencies {
            match self.nodes.get(dependency).map(|node| node.cell().state()) {
                Some(CellState::Fulfilled(value)) => values.push(value.clone()),
                Some(CellState::Rejected(error)) => return Err(error.clone()),
                Some(CellState::Pending) | None => pending = true,
            }
        }
        Ok((!pending).then_some(values))
    }

    fn evaluate(&mut self, id: VariableId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        // Declared but never defined: nothing to run.
        let Some(definition) = node.definition().cloned() else {
            return;
        };
        let generation = node.generation();
        let inputs = match node.resolution_error() {
            Some(error) => Err(error.clone()),
            None => self.gather(node.dependencies()),
        };

        let values = match inputs {
            Ok(Some(values)) => values,
            Ok(None) => return,
            Err(error) => {
                self.settle_now(id, generation, Err(error));
                return;
            }
        };

        match definition {
            Definition::Constant(value) => self.settle_now(id, generation, Ok(value)),
            Definition::Function(f) => {
                let outcome = guarded(|| f(values.as_slice()));
                self.settle_now(id, generation, outcome);
            }
            Definition::Future(f) => match guarded(|| Ok(f(values))) {
                Ok(future) => {
                    let commands = self.commands.clone();
                    let task = tokio::spawn(async move {
                        let outcome = guarded_future(future).await;
                        let _ = commands.send(Command::Settle {
                            variable: id,
                            generation,
                            outcome,
                        });
                    });
                    if let Some(node) = self.nodes.get_mut(&id) {
                        node.attach_task(task);
                    }
                }
                Err(error) => self.settle_now(id, generation, Err(error)),
            },
            Definition::Producer(factory) => match guarded(|| factory(values.as_slice())) {
                Ok(producer) => {
                    let driver = ProducerDriver::start(
                        producer,
                        id,
                        generation,
                        self.commands.clone(),
                        self.frame_interval,
                    );
                    if let Some(node) = self.nodes.get_mut(&id) {
                        node.attach_driver(driver);
                    }
                }
                Err(error) => self.settle_now(id, generation, Err(error)),
            },
        }
    }

    /// Settle during the pass. Dependents are already queued behind us.
    fn settle_now(&mut self, id: VariableId, generation: u64, outcome: Result<Value, DefinitionError>) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.settle(generation, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Harness {
        scheduler: UpdateScheduler,
        module: ModuleId,
        _commands: mpsc::UnboundedReceiver<Command>,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                scheduler: UpdateScheduler::new(tx, &RuntimeConfig::default()),
                module: ModuleId::new(),
                _commands: rx,
            }
        }

        fn declare(&mut self, visible: bool) -> VariableId {
            let variable = VariableId::new();
            let (observer, _) = watch::channel(CellState::Pending);
            self.scheduler.apply(Command::Declare {
                variable,
                module: self.module,
                visible,
                observer,
            });
            variable
        }

        fn define(&mut self, variable: VariableId, name: &str, inputs: &[&str], definition: Definition) {
            self.scheduler.apply(Command::Define {
                variable,
                name: Some(name.to_string()),
                inputs: inputs.iter().map(|input| input.to_string()).collect(),
                definition,
            });
        }

        fn reachable(&self, variable: VariableId) -> bool {
            self.scheduler.node(variable).is_some_and(Node::is_reachable)
        }

        fn state(&self, variable: VariableId) -> CellState {
            self.scheduler
                .node(variable)
                .map(|node| node.cell().state().clone())
                .unwrap_or(CellState::Pending)
        }
    }

    fn concat() -> Definition {
        Definition::function(|inputs| {
            json!(inputs
                .iter()
                .map(|value| value.to_string())
                .collect::<Vec<_>>()
                .join("+"))
        })
    }

    #[test]
    fn chain_is_evaluated_in_one_pass() {
        let mut h = Harness::new();
        let a = h.declare(false);
        let b = h.declare(true);
        h.define(b, "b", &["a"], concat());
        h.define(a, "a", &[], Definition::constant(1));

        let summary = h.scheduler.run_pass();

        assert_eq!(summary.gained, 2);
        assert_eq!(summary.recomputed, 2);
        assert!(h.reachable(a) && h.reachable(b));
        assert_eq!(h.state(b), CellState::Fulfilled(json!("1")));
    }

    #[test]
    fn unreachable_variables_are_not_evaluated() {
        let mut h = Harness::new();
        let a = h.declare(false);
        h.define(a, "a", &[], Definition::constant(1));

        h.scheduler.run_pass();

        assert!(!h.reachable(a));
        assert!(h.state(a).is_pending());
    }

    #[test]
    fn unresolved_name_errors_only_the_referencing_variable() {
        let mut h = Harness::new();
        let a = h.declare(true);
        let b = h.declare(true);
        h.define(a, "a", &["missing"], concat());
        h.define(b, "b", &[], Definition::constant(2));

        h.scheduler.run_pass();

        assert_eq!(
            h.state(a),
            CellState::Rejected(DefinitionError::NotDefined("missing".into()))
        );
        assert_eq!(h.state(b), CellState::Fulfilled(json!(2)));
    }

    #[test]
    fn late_definition_rebinds_dependents() {
        let mut h = Harness::new();
        let a = h.declare(true);
        h.define(a, "a", &["b"], concat());
        h.scheduler.run_pass();

        let b = h.declare(false);
        h.define(b, "b", &[], Definition::constant("late"));
        h.scheduler.run_pass();

        assert!(h.reachable(b));
        assert_eq!(h.state(a), CellState::Fulfilled(json!("\"late\"")));
    }

    #[test]
    fn duplicate_names_are_reported() {
        let mut h = Harness::new();
        let first = h.declare(false);
        let second = h.declare(false);
        let reader = h.declare(true);
        h.define(first, "x", &[], Definition::constant(1));
        h.define(second, "x", &[], Definition::constant(2));
        h.define(reader, "reader", &["x"], concat());

        h.scheduler.run_pass();

        assert_eq!(
            h.state(reader),
            CellState::Rejected(DefinitionError::DefinedMoreThanOnce("x".into()))
        );

        // Removing one claimant restores the binding.
        h.scheduler.apply(Command::Delete { variable: second });
        h.scheduler.run_pass();
        assert_eq!(h.state(reader), CellState::Fulfilled(json!("1")));
    }

    #[test]
    fn dependency_errors_short_circuit() {
        let mut h = Harness::new();
        let a = h.declare(false);
        let b = h.declare(true);
        let runs = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let runs_clone = runs.clone();
        h.define(
            a,
            "a",
            &[],
            Definition::fallible(|_| Err(DefinitionError::thrown("boom"))),
        );
        h.define(
            b,
            "b",
            &["a"],
            Definition::function(move |_| {
                runs_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Value::Null
            }),
        );

        h.scheduler.run_pass();

        assert_eq!(h.state(b), CellState::Rejected(DefinitionError::thrown("boom")));
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn cycles_are_marked_without_running() {
        let mut h = Harness::new();
        let a = h.declare(false);
        let b = h.declare(false);
        h.define(a, "a", &["b"], Definition::function(|_| panic!("must not run")));
        h.define(b, "b", &["a"], Definition::function(|_| panic!("must not run")));

        let summary = h.scheduler.run_pass();

        assert_eq!(summary.circular, 2);
        assert_eq!(summary.recomputed, 0);
        assert_eq!(h.state(a), CellState::Rejected(DefinitionError::Circular));
        assert_eq!(h.state(b), CellState::Rejected(DefinitionError::Circular));
        assert!(!h.reachable(a));
    }

    #[test]
    fn stale_settlement_is_discarded() {
        let mut h = Harness::new();
        let a = h.declare(true);
        h.define(a, "a", &[], Definition::constant(1));
        h.scheduler.run_pass();
        let generation = h.scheduler.node(a).map(Node::generation).unwrap();

        h.define(a, "a", &[], Definition::constant(2));
        h.scheduler.run_pass();
        h.scheduler.apply(Command::Settle {
            variable: a,
            generation,
            outcome: Ok(json!("stale")),
        });

        assert_eq!(h.state(a), CellState::Fulfilled(json!(2)));
    }

    #[test]
    fn flush_replies_are_collected_after_dispose() {
        let mut h = Harness::new();
        let a = h.declare(true);
        h.scheduler.apply(Command::Dispose);
        let (reply, _wait) = oneshot::channel();
        h.scheduler.apply(Command::Flush(reply));
        h.define(a, "a", &[], Definition::constant(1));

        assert!(h.scheduler.is_disposed());
        assert_eq!(h.scheduler.node_count(), 0);
        assert_eq!(h.scheduler.take_flushes().len(), 1);
        assert_eq!(h.scheduler.run_pass(), PassSummary::default());
    }

    #[test]
    fn find_requires_a_unique_name() {
        let mut h = Harness::new();
        let a = h.declare(true);
        h.define(a, "a", &[], Definition::constant(1));
        assert_eq!(h.scheduler.find(h.module, "a").map(Node::id), Some(a));

        let dup = h.declare(true);
        h.define(dup, "a", &[], Definition::constant(2));
        assert!(h.scheduler.find(h.module, "a").is_none());
        assert!(h.scheduler.find(h.module, "nope").is_none());
    }
}
