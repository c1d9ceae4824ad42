//! Variable definitions.
//!
//! A definition is what a variable computes from its resolved dependency
//! values. The scheduler only cares about the shape of the computation:
//! whether it settles immediately, settles later, or keeps producing values.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use super::producer::Producer;
use crate::error::{panic_message, DefinitionError};

type FunctionFn = dyn Fn(&[Value]) -> Result<Value, DefinitionError> + Send + Sync;
type FutureFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, DefinitionError>> + Send + Sync;
type ProducerFn = dyn Fn(&[Value]) -> Result<Box<dyn Producer>, DefinitionError> + Send + Sync;

/// What a variable computes.
///
/// Dependency values are passed positionally, in the order the dependency
/// names were declared.
#[derive(Clone)]
pub enum Definition {
    /// A literal; settles as soon as the variable is reachable.
    Constant(Value),

    /// A synchronous function of the dependency values.
    Function(Arc<FunctionFn>),

    /// An asynchronous function; runs as its own task.
    Future(Arc<FutureFn>),

    /// A factory for a long-lived [`Producer`].
    Producer(Arc<ProducerFn>),
}

impl Definition {
    /// A constant-valued definition.
    pub fn constant(value: impl Into<Value>) -> Self {
        Definition::Constant(value.into())
    }

    /// A synchronous definition that cannot fail.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Definition::Function(Arc::new(move |inputs: &[Value]| Ok(f(inputs))))
    }

    /// A synchronous definition that may fail.
    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, DefinitionError> + Send + Sync + 'static,
    {
        Definition::Function(Arc::new(f))
    }

    /// An asynchronous definition.
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, DefinitionError>> + Send + 'static,
    {
        Definition::Future(Arc::new(move |inputs: Vec<Value>| f(inputs).boxed()))
    }

    /// A producer-backed definition. The factory runs each time the variable
    /// is (re)computed; the previous producer is finalized first.
    pub fn producer<F, P>(factory: F) -> Self
    where
        F: Fn(&[Value]) -> P + Send + Sync + 'static,
        P: Producer,
    {
        Definition::Producer(Arc::new(move |inputs: &[Value]| {
            Ok(Box::new(factory(inputs)) as Box<dyn Producer>)
        }))
    }

    /// Whether this definition yields values over time.
    pub fn is_producer(&self) -> bool {
        matches!(self, Definition::Producer(_))
    }
}

impl From<Value> for Definition {
    fn from(value: Value) -> Self {
        Definition::Constant(value)
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Definition::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            Definition::Function(_) => f.write_str("Function(..)"),
            Definition::Future(_) => f.write_str("Future(..)"),
            Definition::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

/// Run user code, turning a panic into a definition error.
pub(crate) fn guarded<T>(f: impl FnOnce() -> Result<T, DefinitionError>) -> Result<T, DefinitionError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(&*payload);
            tracing::warn!(%message, "definition panicked");
            Err(DefinitionError::Thrown(message))
        }
    }
}

/// Await user code, turning a panic into a definition error.
pub(crate) async fn guarded_future<T>(
    future: impl Future<Output = Result<T, DefinitionError>>,
) -> Result<T, DefinitionError> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(&*payload);
            tracing::warn!(%message, "asynchronous definition panicked");
            Err(DefinitionError::Thrown(message))
        }
    }
}
