//! School error types.

use orchestration::ExecutionError;
use thiserror::Error;

/// Errors raised by the student registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A write was attempted outside a transaction on the current thread.
    #[error("Registry write outside a transaction")]
    NoTransaction,

    /// No student with this id.
    #[error("Unknown student: {0}")]
    UnknownStudent(String),

    /// Another student already uses this email.
    #[error("Email already registered: {0}")]
    DuplicateEmail(String),

    /// The registry refused the call.
    #[error("Registry unavailable for {0}")]
    Unavailable(String),
}

/// Errors returned by [`SchoolService`](crate::SchoolService).
#[derive(Debug, Error)]
pub enum SchoolError {
    /// The operation ran and failed; every completed step was compensated.
    #[error("Operation '{operation}' failed: {source}")]
    Failed {
        operation: String,
        source: ExecutionError,
    },

    /// The engine could not run the operation.
    #[error("Engine error: {0}")]
    Engine(#[from] ExecutionError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistryError {
    /// Converts into the engine error recorded on the failing context.
    pub fn into_execution(self, operation: &str) -> ExecutionError {
        ExecutionError::rejected(operation, self.to_string())
    }
}
