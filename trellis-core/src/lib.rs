//! Trellis Core
//!
//! This crate provides a reactive dataflow runtime. Programs are built from
//! named variables whose definitions read other variables; the runtime keeps
//! every observed variable up to date as definitions change.
//!
//! It implements:
//!
//! - Modules of named variables with name-based dependencies
//! - Reachability tracking from visible variables
//! - Cycle detection with per-variable error reporting
//! - Synchronous, asynchronous and producer-backed definitions
//! - Batched updates with generation-stamped results
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Runtimes, modules, variables, cells and producers
//! - `graph`: Dependency graph, topology queries and the update scheduler
//! - `error`: Errors carried by variables and returned by handles
//! - `config`: Runtime configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::{Definition, Generator, Observation, Runtime};
//! use serde_json::json;
//!
//! let runtime = Runtime::new();
//! let module = runtime.module();
//!
//! // A producer of successive values
//! module.variable(false).define("ticks", &[], Definition::producer(|_| {
//!     Generator::new((1..=3).map(|n| json!(n)))
//! }));
//!
//! // A visible variable derived from it
//! let doubled = module.variable(true);
//! doubled.define("doubled", &["ticks"], Definition::function(|inputs| {
//!     json!(inputs[0].as_i64().unwrap_or(0) * 2)
//! }));
//!
//! assert_eq!(doubled.value().await?, Observation::value(2));
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::RuntimeConfig;
pub use error::{DefinitionError, RuntimeError};
pub use reactive::{
    Batch, CellState, Definition, Generator, Module, Observation, Producer, ProducerHandle,
    Runtime, StreamProducer, Variable,
};
