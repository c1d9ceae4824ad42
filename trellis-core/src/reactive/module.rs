//! Modules and Variables
//!
//! These are the handles user code holds. They are cheap to clone and carry
//! no graph state of their own: mutations are queued for the scheduler,
//! getters read the scheduler's state under a short read lock.
//!
//! # Example
//!
//! ```rust,ignore
//! let runtime = Runtime::new();
//! let module = runtime.module();
//!
//! module.variable(false).define("x", &[], Definition::constant(2));
//! let y = module.variable(true);
//! y.define("y", &["x"], Definition::function(|inputs| json!(inputs[0].as_i64().unwrap_or(0) * 21)));
//!
//! assert_eq!(y.value().await?, Observation::value(42));
//! ```

use serde_json::Value;
use tokio::sync::watch;

use super::cell::{CellState, Observation};
use super::definition::Definition;
use super::producer::ProducerHandle;
use super::runtime::Runtime;
use crate::error::RuntimeError;
use crate::graph::{Command, ModuleId, Node, VariableId};

/// A namespace of variables. Dependency names resolve within one module.
#[derive(Debug, Clone)]
pub struct Module {
    runtime: Runtime,
    id: ModuleId,
}

impl Module {
    pub(crate) fn new(runtime: Runtime, id: ModuleId) -> Self {
        Self { runtime, id }
    }

    /// The runtime this module belongs to.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Declare a new, undefined variable.
    ///
    /// A `visible` variable is an observed root: it is always reachable and
    /// keeps everything it depends on alive.
    pub fn variable(&self, visible: bool) -> Variable {
        let id = VariableId::new();
        let (observer, receiver) = watch::channel(CellState::Pending);
        let declared = self.runtime.send(Command::Declare {
            variable: id,
            module: self.id,
            visible,
            observer,
        });
        if declared.is_err() {
            tracing::warn!(?id, "variable declared on a disposed runtime");
        }
        Variable {
            runtime: self.runtime.clone(),
            id,
            observer: receiver,
        }
    }

    /// Redefine the variable currently named `name`.
    pub async fn redefine(
        &self,
        name: &str,
        inputs: &[&str],
        definition: Definition,
    ) -> Result<Variable, RuntimeError> {
        let variable = self.lookup(name).await?;
        variable.define(name, inputs, definition);
        Ok(variable)
    }

    /// Wait for the value of the variable named `name`.
    pub async fn value(&self, name: &str) -> Result<Observation, RuntimeError> {
        self.lookup(name).await?.value().await
    }

    async fn lookup(&self, name: &str) -> Result<Variable, RuntimeError> {
        self.runtime.flush().await?;
        let scheduler = self.runtime.scheduler().read();
        let node = scheduler
            .find(self.id, name)
            .ok_or_else(|| RuntimeError::NotDefined(name.to_string()))?;
        Ok(Variable {
            runtime: self.runtime.clone(),
            id: node.id(),
            observer: node.cell().subscribe(),
        })
    }
}

/// A handle to one variable.
#[derive(Debug, Clone)]
pub struct Variable {
    runtime: Runtime,
    id: VariableId,
    observer: watch::Receiver<CellState>,
}

impl Variable {
    /// The variable's ID.
    pub fn id(&self) -> VariableId {
        self.id
    }

    /// Give the variable a name, dependencies and a definition. Takes effect
    /// on the next scheduler pass.
    pub fn define(&self, name: &str, inputs: &[&str], definition: Definition) -> &Self {
        self.submit(Some(name.to_string()), inputs, definition)
    }

    /// Like [`define`](Variable::define), without a name. Anonymous variables
    /// cannot be depended upon.
    pub fn define_anonymous(&self, inputs: &[&str], definition: Definition) -> &Self {
        self.submit(None, inputs, definition)
    }

    /// Define the variable as a constant with no dependencies.
    pub fn define_value(&self, name: &str, value: impl Into<Value>) -> &Self {
        self.define(name, &[], Definition::constant(value))
    }

    fn submit(&self, name: Option<String>, inputs: &[&str], definition: Definition) -> &Self {
        let sent = self.runtime.send(Command::Define {
            variable: self.id,
            name,
            inputs: inputs.iter().map(|input| input.to_string()).collect(),
            definition,
        });
        if sent.is_err() {
            tracing::warn!(id = ?self.id, "define on a disposed runtime");
        }
        self
    }

    /// Remove the variable from its module. Its producer (if any) is
    /// finalized and dependents see the name as undefined.
    pub fn delete(self) {
        let _ = self.runtime.send(Command::Delete { variable: self.id });
    }

    fn read<T>(&self, f: impl FnOnce(&Node) -> T) -> Option<T> {
        let scheduler = self.runtime.scheduler().read();
        scheduler.node(self.id).map(f)
    }

    /// The variable's current name.
    pub fn name(&self) -> Option<String> {
        self.read(|node| node.name().map(str::to_string)).flatten()
    }

    /// Whether the last pass found the variable reachable.
    pub fn is_reachable(&self) -> bool {
        self.read(Node::is_reachable).unwrap_or(false)
    }

    /// The variable's generation.
    pub fn generation(&self) -> u64 {
        self.read(Node::generation).unwrap_or(0)
    }

    /// The current settled value, or `None` while pending.
    pub fn current(&self) -> Option<Observation> {
        self.read(|node| node.cell().state().observation()).flatten()
    }

    /// The live producer, for producer-backed variables that are running.
    pub fn producer(&self) -> Option<ProducerHandle> {
        self.read(Node::producer).flatten()
    }

    /// Wait for the variable to settle, after applying every change queued so
    /// far.
    ///
    /// A variable that is never computed (unreachable and not circular, or
    /// never defined) never settles.
    pub async fn value(&self) -> Result<Observation, RuntimeError> {
        self.runtime.flush().await?;
        // A deleted variable keeps its last value in the channel.
        if self.observer.has_changed().is_err() {
            return Err(RuntimeError::Detached);
        }
        let mut observer = self.observer.clone();
        let state = observer
            .wait_for(|state| !state.is_pending())
            .await
            .map_err(|_| RuntimeError::Detached)?;
        let observation = state.observation();
        observation.ok_or(RuntimeError::Detached)
    }

    /// Watch the variable's cell state.
    pub fn subscribe(&self) -> watch::Receiver<CellState> {
        self.observer.clone()
    }
}
