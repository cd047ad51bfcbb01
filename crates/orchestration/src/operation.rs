//! The reversible operation contract.

use std::sync::{Arc, OnceLock, Weak};

use serde_json::Value;

use crate::context::{ExecutionContext, Input, log_transition};
use crate::error::{ExecutionError, Result};
use crate::state::ContextState;

/// Shared handle to an operation, usually its decorated instance.
pub type SharedOperation = Arc<dyn Operation>;

/// A reversible unit of work.
///
/// `do_operation` must leave the context in `DONE` or `FAIL`, and
/// `undo_operation` in `UNDONE` or `FAIL`. Neither may report ordinary
/// failures through their return value: validation and business errors are
/// captured into the context. `Err` is reserved for fatal errors
/// (see [`ExecutionError::is_fatal`]) that abort the surrounding batch.
///
/// Running `do_operation` twice on one context is a caller bug; orchestrators
/// only hand `READY` contexts to it.
pub trait Operation: Send + Sync {
    /// Stable identity of this operation.
    fn id(&self) -> &str;

    /// The decorated instance of this operation.
    ///
    /// Nested invocations go through this handle so they run under the same
    /// execution guarantees (e.g. a transactional scope) as top-level calls.
    fn self_ref(&self) -> Result<SharedOperation>;

    /// Builds and validates a context without executing anything.
    fn create_context(&self, input: Input) -> ExecutionContext;

    /// Builds a fresh `READY` context carrying the same input as `spent`.
    fn recreate_context(&self, spent: &ExecutionContext) -> ExecutionContext {
        self.create_context(spent.redo_input().clone())
    }

    /// Resource-free preparation run before `do_operation`.
    ///
    /// The parallel executor runs this on a worker thread, outside the
    /// owning thread's transactional scope; it may enrich the redo input
    /// while the context is still `READY`.
    fn prefetch(&self, _context: &mut ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn do_operation(&self, context: &mut ExecutionContext) -> Result<()>;

    fn undo_operation(&self, context: &mut ExecutionContext) -> Result<()>;
}

/// Late-bound handle from an operation to its decorated instance.
///
/// Bound exactly once by [`wire`]; holds a weak reference so an operation and
/// its decorator do not keep each other alive.
#[derive(Clone, Default)]
pub struct SelfRef {
    cell: Arc<OnceLock<Weak<dyn Operation>>>,
}

impl SelfRef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the handle; returns false if it was already bound.
    pub fn bind(&self, operation: &SharedOperation) -> bool {
        self.cell.set(Arc::downgrade(operation)).is_ok()
    }

    /// Resolves the decorated instance on behalf of the operation `id`.
    pub fn get(&self, id: &str) -> Result<SharedOperation> {
        self.cell
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ExecutionError::Unbound(id.to_string()))
    }

    pub fn is_bound(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl std::fmt::Debug for SelfRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfRef")
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// Supplies the execution wrapper (e.g. "run under a new transactional
/// scope") that every invocation of an operation goes through.
pub trait OperationDecorator: Send + Sync {
    fn decorate(&self, operation: SharedOperation) -> SharedOperation;
}

/// Decorator that returns operations unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Undecorated;

impl OperationDecorator for Undecorated {
    fn decorate(&self, operation: SharedOperation) -> SharedOperation {
        operation
    }
}

/// Builds an operation, decorates it and binds its [`SelfRef`].
///
/// The returned handle is the decorated instance; callers keep it alive.
pub fn wire<O, F>(decorator: &dyn OperationDecorator, build: F) -> SharedOperation
where
    O: Operation + 'static,
    F: FnOnce(SelfRef) -> O,
{
    let self_ref = SelfRef::new();
    let operation: SharedOperation = Arc::new(build(self_ref.clone()));
    let decorated = decorator.decorate(operation);
    self_ref.bind(&decorated);
    decorated
}

/// Outcome of a successful [`Command::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    /// Result exposed on the context.
    pub result: Value,
    /// Snapshot handed back to [`Command::rollback`].
    pub undo: Value,
}

impl Executed {
    pub fn new(result: Value, undo: Value) -> Self {
        Self { result, undo }
    }
}

/// Business logic of a leaf operation.
///
/// Wrap it in a [`Leaf`] to obtain the full [`Operation`] contract.
pub trait Command: Send + Sync {
    /// Name used as the operation id.
    fn name(&self) -> &str;

    /// Checks the input before execution; a payload is required by default.
    fn validate(&self, input: &Input) -> Result<()> {
        match input {
            Input::Value(_) => Ok(()),
            _ => Err(ExecutionError::invalid_input(
                self.name(),
                "expected a payload",
            )),
        }
    }

    /// Resource-free preparation, see [`Operation::prefetch`].
    fn prefetch(&self, _input: &mut Input) -> Result<()> {
        Ok(())
    }

    fn execute(&self, input: &Value) -> Result<Executed>;

    fn rollback(&self, undo: &Value) -> Result<()>;
}

/// Adapter running a [`Command`] under the context state machine.
pub struct Leaf<C> {
    self_ref: SelfRef,
    command: C,
}

impl<C: Command> Leaf<C> {
    pub fn new(self_ref: SelfRef, command: C) -> Self {
        Self { self_ref, command }
    }

    pub fn command(&self) -> &C {
        &self.command
    }
}

impl<C: Command + 'static> Leaf<C> {
    /// Wires an undecorated leaf for `command`.
    pub fn shared(command: C) -> SharedOperation {
        wire(&Undecorated, |self_ref| Leaf::new(self_ref, command))
    }
}

impl<C: Command> Operation for Leaf<C> {
    fn id(&self) -> &str {
        self.command.name()
    }

    fn self_ref(&self) -> Result<SharedOperation> {
        self.self_ref.get(self.command.name())
    }

    fn create_context(&self, input: Input) -> ExecutionContext {
        let outcome = self.command.validate(&input);
        ExecutionContext::for_operation(self, input).validated(outcome)
    }

    fn prefetch(&self, context: &mut ExecutionContext) -> Result<()> {
        self.command.prefetch(context.redo_input_mut()?)
    }

    fn do_operation(&self, context: &mut ExecutionContext) -> Result<()> {
        if !context.state().can_start() {
            tracing::warn!(
                operation = self.id(),
                context = %context.id(),
                state = %context.state(),
                "do requested on a context that is not ready"
            );
            if context.state() == ContextState::Init {
                log_transition(context.fail(ExecutionError::invalid_input(
                    self.id(),
                    "context was never validated",
                )));
            }
            return Ok(());
        }

        // Inputs may have changed since the context was built (result transfer).
        if let Err(error) = self.command.validate(context.redo_input()) {
            log_transition(context.fail(error));
            return Ok(());
        }
        let Some(input) = context.redo_input().as_value().cloned() else {
            log_transition(context.fail(ExecutionError::invalid_input(
                self.id(),
                "expected a payload",
            )));
            return Ok(());
        };

        log_transition(context.start());
        let outcome = match self.command.execute(&input) {
            Ok(executed) => context.complete(executed.result, Some(Input::Value(executed.undo))),
            Err(error) => {
                tracing::debug!(operation = self.id(), %error, "command failed");
                context.fail(error)
            }
        };
        log_transition(outcome);
        Ok(())
    }

    fn undo_operation(&self, context: &mut ExecutionContext) -> Result<()> {
        if let Err(error) = context.begin_undo() {
            tracing::warn!(operation = self.id(), %error, "undo requested outside DONE");
            return Ok(());
        }

        let outcome = match context.undo_input().and_then(Input::as_value).cloned() {
            None => context.fail(ExecutionError::rollback_failed(
                self.id(),
                "no undo snapshot recorded",
            )),
            Some(undo) => match self.command.rollback(&undo) {
                Ok(()) => context.mark_undone(),
                Err(error) => {
                    tracing::warn!(operation = self.id(), %error, "command rollback failed");
                    context.fail(error)
                }
            },
        };
        log_transition(outcome);
        Ok(())
    }
}
