//! Reactive Primitives
//!
//! This module implements the user-facing side of the dataflow engine:
//! runtimes, modules, variables, and the values that flow between them.
//!
//! # Concepts
//!
//! ## Variables
//!
//! A Variable is a named cell in a module. Its definition is a constant, a
//! synchronous function, an asynchronous future, or a producer of successive
//! values. Its inputs are the names of other variables in the same module.
//!
//! ## Visibility and Reachability
//!
//! Only visible variables (and everything they transitively read) are
//! computed. A variable that nobody observes costs nothing; if it was
//! producing values, its producer is finalized as soon as it becomes
//! unreachable.
//!
//! ## Producers
//!
//! A producer yields a sequence of values over time. Each yielded value
//! flows into dependents as a fresh input. See [`Producer`].
//!
//! # Implementation Notes
//!
//! Every mutation is a message to the runtime's scheduling task. Messages
//! sent within one synchronous burst are applied together, so redefining
//! several variables at once never exposes intermediate states.

mod cell;
mod definition;
mod module;
mod producer;
mod runtime;

pub use cell::{CellState, Observation, ValueCell};
pub use definition::Definition;
pub use module::{Module, Variable};
pub use producer::{Generator, Producer, ProducerDriver, ProducerHandle, StreamProducer};
pub use runtime::{Batch, Runtime};

pub(crate) use definition::{guarded, guarded_future};
