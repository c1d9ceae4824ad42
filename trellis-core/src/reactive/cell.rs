//! Value Cell
//!
//! A cell holds the resolved value (or error) of one variable. Every
//! computation the scheduler starts is stamped with the variable's generation;
//! the cell only accepts a result carrying the generation it was last reset
//! with, so a superseded computation can finish whenever it likes and its
//! result simply vanishes.
//!
//! Observers (tests, UI bindings) watch the cell through a
//! [`tokio::sync::watch`] channel. The channel only ever sees states that
//! were actually applied.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::DefinitionError;

/// The settlement state of a cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellState {
    /// No value yet for the current generation.
    Pending,

    /// The computation produced a value.
    Fulfilled(Value),

    /// The computation (or a dependency, or the graph structure) failed.
    Rejected(DefinitionError),
}

impl CellState {
    /// Whether the cell is still waiting on a computation.
    pub fn is_pending(&self) -> bool {
        matches!(self, CellState::Pending)
    }

    /// Convert a settled state into its external shape. `None` while pending.
    pub fn observation(&self) -> Option<Observation> {
        match self {
            CellState::Pending => None,
            CellState::Fulfilled(value) => Some(Observation::Value(value.clone())),
            CellState::Rejected(error) => Some(Observation::Error(error.to_string())),
        }
    }
}

impl From<Result<Value, DefinitionError>> for CellState {
    fn from(outcome: Result<Value, DefinitionError>) -> Self {
        match outcome {
            Ok(value) => CellState::Fulfilled(value),
            Err(error) => CellState::Rejected(error),
        }
    }
}

/// A settled value as seen from outside the graph.
///
/// Serializes as `{"value": ...}` or `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Observation {
    /// The variable resolved to a value.
    Value(Value),

    /// The variable failed with the given description.
    Error(String),
}

impl Observation {
    /// Shorthand for `Observation::Value(value.into())`.
    pub fn value(value: impl Into<Value>) -> Self {
        Observation::Value(value.into())
    }

    /// Shorthand for `Observation::Error(message.into())`.
    pub fn error(message: impl Into<String>) -> Self {
        Observation::Error(message.into())
    }
}

/// The current value of one variable plus the generation that owns it.
#[derive(Debug)]
pub struct ValueCell {
    state: CellState,

    /// Generation of the computation this cell is waiting on (or settled by).
    generation: u64,

    /// Bumped on every applied settlement.
    version: u64,

    observer: watch::Sender<CellState>,
}

impl ValueCell {
    /// Create a pending cell that publishes to `observer`.
    pub fn new(observer: watch::Sender<CellState>) -> Self {
        Self {
            state: CellState::Pending,
            generation: 0,
            version: 0,
            observer,
        }
    }

    /// Current state.
    pub fn state(&self) -> &CellState {
        &self.state
    }

    /// Generation the cell is currently bound to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of settlements applied so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// A new receiver for the published states.
    pub fn subscribe(&self) -> watch::Receiver<CellState> {
        self.observer.subscribe()
    }

    /// Bind the cell to a new computation: it goes pending and anything
    /// stamped with an older generation will be refused.
    pub fn reset(&mut self, generation: u64) {
        self.generation = generation;
        self.publish(CellState::Pending);
    }

    /// Re-stamp the cell without touching its state. Used when a variable is
    /// torn down: its last value stays readable but in-flight work is orphaned.
    pub fn orphan(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Apply a result. Returns `false` (and changes nothing) when the result
    /// belongs to a superseded generation.
    pub fn settle(&mut self, generation: u64, outcome: Result<Value, DefinitionError>) -> bool {
        if generation != self.generation {
            return false;
        }
        self.version += 1;
        self.publish(outcome.into());
        true
    }

    fn publish(&mut self, state: CellState) {
        self.observer.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        self.state = state;
    }
}
