//! Error Types
//!
//! Errors come in two flavours. A [`DefinitionError`] is a *value*: it is
//! stored in a variable's cell and flows to dependents like any other result.
//! A [`RuntimeError`] is returned from the handle API when an operation cannot
//! be carried out at all.

use thiserror::Error;

/// An error held by a variable's cell.
///
/// These never abort a scheduler pass; they are local to the variable that
/// produced them (and to dependents, which inherit the upstream error).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// The variable is a member of, or depends on, a dependency cycle.
    #[error("circular definition")]
    Circular,

    /// A dependency name does not resolve to any variable in the module.
    #[error("{0} is not defined")]
    NotDefined(String),

    /// A dependency name is claimed by more than one variable in the module.
    #[error("{0} is defined more than once")]
    DefinedMoreThanOnce(String),

    /// The definition itself failed.
    #[error("{0}")]
    Thrown(String),
}

impl DefinitionError {
    /// Build a [`DefinitionError::Thrown`] from any message.
    pub fn thrown(message: impl Into<String>) -> Self {
        Self::Thrown(message.into())
    }
}

impl From<String> for DefinitionError {
    fn from(message: String) -> Self {
        Self::Thrown(message)
    }
}

impl From<&str> for DefinitionError {
    fn from(message: &str) -> Self {
        Self::Thrown(message.to_string())
    }
}

/// Errors returned by the runtime handle API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The runtime was disposed, or the variable was deleted, so nothing will
    /// ever settle it again.
    #[error("variable is detached from its runtime")]
    Detached,

    /// No variable in the module currently holds the given name.
    #[error("{0} is not defined")]
    NotDefined(String),
}

/// Recover a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "definition panicked".to_string()
    }
}
