//! Fan-out strategies for composite operations.

pub mod parallel;
pub mod sequential;

use std::sync::Arc;

use crate::composite::MacroHooks;
use crate::context::{ExecutionContext, log_transition};
use crate::error::{ExecutionError, Result};
use crate::listener::StateChangeListener;
use crate::operation::{Operation, SharedOperation};
use crate::state::ContextState;

pub use parallel::ParallelExecutor;
pub use sequential::SequentialExecutor;

/// Nested contexts after a fan-out, in submission order.
///
/// `None` marks a context that was lost during execution.
pub type NestedResults = Vec<Option<ExecutionContext>>;

/// Drives nested contexts through their do and undo passes.
pub trait NestedExecutor: Send + Sync {
    /// Runs the do pass of every context with `listener` registered on it.
    ///
    /// Returns `Err` only for fatal errors, which abort the whole batch.
    fn execute_nested(
        &self,
        contexts: Vec<ExecutionContext>,
        listener: &Arc<dyn StateChangeListener>,
        hooks: &dyn MacroHooks,
    ) -> Result<NestedResults>;

    /// Runs the undo pass of every context.
    fn rollback_nested(&self, contexts: Vec<ExecutionContext>) -> Result<NestedResults>;
}

/// Which half of an operation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pass {
    Do,
    Undo,
}

impl Pass {
    pub(crate) fn run(
        self,
        operation: &dyn Operation,
        context: &mut ExecutionContext,
        listener: Option<&Arc<dyn StateChangeListener>>,
    ) -> Result<()> {
        let run = |context: &mut ExecutionContext| match self {
            Pass::Do => operation.do_operation(context),
            Pass::Undo => operation.undo_operation(context),
        };
        match listener {
            Some(listener) => context.scoped(listener, run),
            None => run(context),
        }
    }
}

/// Resolves the operation that owns `context`.
///
/// A context whose owner is gone is failed in place when that is still legal.
pub(crate) fn resolve_owner(context: &mut ExecutionContext) -> Option<SharedOperation> {
    let owner = context.owner();
    if owner.is_none() {
        tracing::warn!(
            context = %context.id(),
            operation = context.owner_id(),
            "nested context has no live owner"
        );
        if matches!(context.state(), ContextState::Init | ContextState::Ready) {
            log_transition(context.fail(ExecutionError::Unbound(context.owner_id().to_string())));
        }
    }
    owner
}

/// Runs `prefetch` on a `READY` context, failing it on error.
pub(crate) fn prefetch(operation: &dyn Operation, context: &mut ExecutionContext) -> bool {
    if context.state() != ContextState::Ready {
        return true;
    }
    match operation.prefetch(context) {
        Ok(()) => true,
        Err(error) => {
            tracing::debug!(operation = operation.id(), %error, "prefetch failed");
            log_transition(context.fail(error));
            false
        }
    }
}
