//! In-order execution on the calling thread.

use std::sync::Arc;

use serde_json::Value;

use super::{NestedExecutor, NestedResults, Pass, prefetch, resolve_owner};
use crate::composite::MacroHooks;
use crate::context::{ExecutionContext, log_transition};
use crate::error::Result;
use crate::listener::StateChangeListener;
use crate::operation::SharedOperation;
use crate::state::ContextState;

/// Runs nested contexts one after another, feeding each step the result of
/// the previous one through [`MacroHooks::transfer_result`].
///
/// The first failure cancels every context after it. Rollback walks the
/// contexts in reverse and stops at the first rollback that fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialExecutor;

impl SequentialExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl NestedExecutor for SequentialExecutor {
    #[tracing::instrument(skip_all, fields(nested = contexts.len()))]
    fn execute_nested(
        &self,
        contexts: Vec<ExecutionContext>,
        listener: &Arc<dyn StateChangeListener>,
        hooks: &dyn MacroHooks,
    ) -> Result<NestedResults> {
        let mut results = Vec::with_capacity(contexts.len());
        let mut previous: Option<(SharedOperation, Value)> = None;
        let mut failed = false;

        for mut context in contexts {
            context.scoped(listener, |context| -> Result<()> {
                if failed {
                    if context.state().can_cancel() {
                        log_transition(context.cancel());
                    }
                    tracing::debug!(
                        operation = context.owner_id(),
                        last_good = ?context.last_known_good_state(),
                        "skipping step after earlier failure"
                    );
                    return Ok(());
                }

                let Some(operation) = resolve_owner(context) else {
                    failed = true;
                    return Ok(());
                };
                if context.state() != ContextState::Ready {
                    failed = true;
                    return Ok(());
                }

                if let Some((previous_operation, previous_result)) = &previous
                    && let Err(error) =
                        hooks.transfer_result(previous_operation.as_ref(), previous_result, context)
                {
                    tracing::warn!(
                        from = previous_operation.id(),
                        to = operation.id(),
                        %error,
                        "result transfer failed"
                    );
                    log_transition(context.fail(error));
                    failed = true;
                    return Ok(());
                }

                if prefetch(operation.as_ref(), context) {
                    Pass::Do.run(operation.as_ref(), context, None)?;
                }

                match (context.state(), context.result()) {
                    (ContextState::Done, Some(result)) => {
                        previous = Some((operation, result.clone()));
                    }
                    (ContextState::Done, None) => {
                        previous = Some((operation, Value::Null));
                    }
                    _ => failed = true,
                }
                Ok(())
            })?;
            results.push(Some(context));
        }
        Ok(results)
    }

    #[tracing::instrument(skip_all, fields(nested = contexts.len()))]
    fn rollback_nested(&self, contexts: Vec<ExecutionContext>) -> Result<NestedResults> {
        let mut slots: NestedResults = contexts.into_iter().map(Some).collect();
        let mut stopped = false;

        for slot in slots.iter_mut().rev() {
            let Some(context) = slot.as_mut() else {
                continue;
            };
            if stopped {
                tracing::debug!(
                    operation = context.owner_id(),
                    state = %context.state(),
                    "rollback halted, leaving context as is"
                );
                continue;
            }
            if !context.state().can_undo() {
                continue;
            }
            let Some(operation) = resolve_owner(context) else {
                stopped = true;
                continue;
            };

            Pass::Undo.run(operation.as_ref(), context, None)?;
            if context.state() != ContextState::Undone {
                tracing::warn!(operation = operation.id(), "rollback failed, halting");
                stopped = true;
            }
        }
        Ok(slots)
    }
}
