//! Orchestration error types.

use std::time::Duration;

use common::ContextId;
use thiserror::Error;

use crate::state::ContextState;

/// Errors raised while building, executing or rolling back operations.
///
/// Most variants never leave an operation boundary: they are captured into
/// the failing [`ExecutionContext`](crate::ExecutionContext). Only the
/// variants for which [`ExecutionError::is_fatal`] returns true propagate
/// to the caller of an orchestrator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    /// The input parameter is missing or ill-typed.
    #[error("Invalid input for operation '{operation}': {reason}")]
    InvalidInput { operation: String, reason: String },

    /// Business logic rejected the operation.
    #[error("Operation '{operation}' failed: {reason}")]
    Rejected { operation: String, reason: String },

    /// Undoing a previously successful operation failed.
    #[error("Rollback of operation '{operation}' failed: {reason}")]
    RollbackFailed { operation: String, reason: String },

    /// A sequential macro-operation does not define how to hand a result on.
    #[error("Cannot transfer result of '{from}' into '{to}'")]
    CannotTransferResult { from: String, to: String },

    /// The requested state transition is not in the transition table.
    #[error("Illegal transition for context {context}: {from} -> {to}")]
    IllegalTransition {
        context: ContextId,
        from: ContextState,
        to: ContextState,
    },

    /// A nested execution produced no context at all.
    #[error("Nested context at position {0} produced no result")]
    MissingResult(usize),

    /// A composite was asked to run with a hole in its nested contexts.
    #[error("Composite '{0}' has a missing nested context")]
    MissingNestedContext(String),

    /// The operation was never bound to its decorated instance.
    #[error("Operation '{0}' is not bound to its execution wrapper")]
    Unbound(String),

    /// The batch cannot proceed; the relay or worker pool is gone.
    #[error("Cannot execute command: {0}")]
    CannotExecute(String),

    /// The relay queue rejected a request.
    #[error("Relay queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// A bounded wait expired.
    #[error("Timed out after {elapsed:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: &'static str,
        elapsed: Duration,
    },

    /// Payload encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ExecutionError {
    /// Shorthand for [`ExecutionError::InvalidInput`].
    pub fn invalid_input(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`ExecutionError::Rejected`].
    pub fn rejected(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`ExecutionError::RollbackFailed`].
    pub fn rollback_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RollbackFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for errors that abort a whole batch and reach the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExecutionError::CannotExecute(_)
                | ExecutionError::QueueFull { .. }
                | ExecutionError::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for ExecutionError {
    fn from(e: serde_json::Error) -> Self {
        ExecutionError::Serialization(e.to_string())
    }
}

/// Convenience type alias for orchestration results.
pub type Result<T> = std::result::Result<T, ExecutionError>;
