//! Execution contexts: the per-invocation state threaded through an operation.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use common::ContextId;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ExecutionError, Result};
use crate::listener::StateChangeListener;
use crate::operation::{Operation, SharedOperation};
use crate::state::ContextState;

/// Input handed to an operation's do or undo pass.
#[derive(Debug, Clone, Default)]
pub enum Input {
    /// No parameter.
    #[default]
    Empty,

    /// A business payload.
    Value(Value),

    /// Nested contexts of a composite operation.
    Macro(MacroExecutionParameter),
}

impl Input {
    /// Serializes `value` into a payload input.
    pub fn value(value: impl Serialize) -> Result<Self> {
        Ok(Input::Value(serde_json::to_value(value)?))
    }

    /// Returns the payload, if this input carries one.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Input::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the nested contexts, if this input carries them.
    pub fn as_macro(&self) -> Option<&MacroExecutionParameter> {
        match self {
            Input::Macro(parameter) => Some(parameter),
            _ => None,
        }
    }

    /// Returns true for [`Input::Empty`].
    pub fn is_empty(&self) -> bool {
        matches!(self, Input::Empty)
    }

    /// Deserializes the payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Input::Value(value) => Ok(serde_json::from_value(value.clone())?),
            Input::Empty => Err(ExecutionError::Serialization(
                "input is empty".to_string(),
            )),
            Input::Macro(_) => Err(ExecutionError::Serialization(
                "input carries nested contexts, not a payload".to_string(),
            )),
        }
    }
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Input::Value(value)
    }
}

impl From<MacroExecutionParameter> for Input {
    fn from(parameter: MacroExecutionParameter) -> Self {
        Input::Macro(parameter)
    }
}

/// The ordered nested contexts of a composite operation.
///
/// Clones share the same collection, so the parent's redo and undo inputs
/// can point at one set that is swapped as a whole after each execution or
/// rollback pass. A `None` slot is a nested context that went missing.
#[derive(Clone, Default)]
pub struct MacroExecutionParameter {
    nested: Arc<Mutex<Vec<Option<ExecutionContext>>>>,
}

impl MacroExecutionParameter {
    /// Wraps a complete set of nested contexts.
    pub fn new(contexts: Vec<ExecutionContext>) -> Self {
        Self::from_slots(contexts.into_iter().map(Some).collect())
    }

    /// Wraps nested context slots, some of which may be missing.
    pub fn from_slots(slots: Vec<Option<ExecutionContext>>) -> Self {
        Self {
            nested: Arc::new(Mutex::new(slots)),
        }
    }

    /// Removes and returns every slot, leaving the collection empty.
    pub fn take(&self) -> Vec<Option<ExecutionContext>> {
        std::mem::take(&mut *self.lock())
    }

    /// Replaces the whole collection.
    pub fn replace(&self, slots: Vec<Option<ExecutionContext>>) {
        *self.lock() = slots;
    }

    /// Number of slots, missing ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if there are no slots.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// State of every slot, `None` for missing contexts.
    pub fn states(&self) -> Vec<Option<ContextState>> {
        self.lock()
            .iter()
            .map(|slot| slot.as_ref().map(ExecutionContext::state))
            .collect()
    }

    /// Runs `f` with read access to the slots.
    pub fn with_slots<R>(&self, f: impl FnOnce(&[Option<ExecutionContext>]) -> R) -> R {
        f(&self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Option<ExecutionContext>>> {
        self.nested.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MacroExecutionParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacroExecutionParameter")
            .field("states", &self.states())
            .finish()
    }
}

/// State of one operation invocation.
///
/// The same context is mutated in place by the do pass and, later, by the
/// undo pass, so listeners observe its whole lifecycle. Every state change
/// goes through the transition table in [`ContextState::permits`].
pub struct ExecutionContext {
    id: ContextId,
    owner_id: String,
    owner: Option<Weak<dyn Operation>>,
    state: ContextState,
    redo_input: Input,
    undo_input: Option<Input>,
    result: Option<Value>,
    error: Option<ExecutionError>,
    history: Vec<ContextState>,
    listeners: Vec<Arc<dyn StateChangeListener>>,
}

impl ExecutionContext {
    /// Creates a context in `INIT` for the operation identified by `owner_id`.
    pub fn new(owner_id: impl Into<String>, owner: Option<Weak<dyn Operation>>, input: Input) -> Self {
        Self {
            id: ContextId::new(),
            owner_id: owner_id.into(),
            owner,
            state: ContextState::Init,
            redo_input: input,
            undo_input: None,
            result: None,
            error: None,
            history: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Creates a context owned by the decorated instance of `operation`.
    ///
    /// An operation that was never bound to its execution wrapper yields a
    /// context that is already failed with [`ExecutionError::Unbound`].
    pub fn for_operation(operation: &dyn Operation, input: Input) -> Self {
        match operation.self_ref() {
            Ok(shared) => Self::new(operation.id(), Some(Arc::downgrade(&shared)), input),
            Err(error) => {
                let mut context = Self::new(operation.id(), None, input);
                context.history.push(ContextState::Init);
                context.state = ContextState::Fail;
                context.error = Some(error);
                context
            }
        }
    }

    /// Applies a validation outcome to a context still in `INIT`.
    pub fn validated(mut self, outcome: Result<()>) -> Self {
        if self.state == ContextState::Init {
            let applied = match outcome {
                Ok(()) => self.mark_ready(),
                Err(error) => self.fail(error),
            };
            log_transition(applied);
        }
        self
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Id of the operation that created this context.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// The operation that created this context, if it is still alive.
    pub fn owner(&self) -> Option<SharedOperation> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }

    pub fn redo_input(&self) -> &Input {
        &self.redo_input
    }

    /// Mutable access to the redo input, only before execution starts.
    pub fn redo_input_mut(&mut self) -> Result<&mut Input> {
        match self.state {
            ContextState::Init | ContextState::Ready => Ok(&mut self.redo_input),
            state => Err(ExecutionError::IllegalTransition {
                context: self.id,
                from: state,
                to: ContextState::Ready,
            }),
        }
    }

    /// Snapshot recorded by the do pass for the undo pass.
    pub fn undo_input(&self) -> Option<&Input> {
        self.undo_input.as_ref()
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Deserializes the result into `T`.
    pub fn result_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.result
            .as_ref()
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(ExecutionError::from)
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        self.error.as_ref()
    }

    /// Prior states, oldest first.
    pub fn history(&self) -> &[ContextState] {
        &self.history
    }

    /// Most recent state, current included, in which the context was healthy.
    ///
    /// For a cancelled context this is the state it was cancelled from.
    pub fn last_known_good_state(&self) -> Option<ContextState> {
        std::iter::once(self.state)
            .chain(self.history.iter().rev().copied())
            .find(|state| {
                matches!(
                    state,
                    ContextState::Ready | ContextState::Done | ContextState::Undone
                )
            })
    }

    /// `INIT -> READY`: the parameter passed validation.
    pub fn mark_ready(&mut self) -> Result<()> {
        self.transition(ContextState::Ready)
    }

    /// `READY -> WORK`: the do pass starts.
    pub fn start(&mut self) -> Result<()> {
        self.transition(ContextState::Work)
    }

    /// `WORK -> DONE`: records the result and the snapshot for a later undo.
    pub fn complete(&mut self, result: Value, undo_input: Option<Input>) -> Result<()> {
        self.guard(ContextState::Done)?;
        self.result = Some(result);
        self.undo_input = undo_input;
        self.error = None;
        self.commit(ContextState::Done);
        Ok(())
    }

    /// `INIT | READY | WORK -> FAIL`: records the error.
    ///
    /// A failed undo pass drops the result recorded by the do pass, so that
    /// a failed context only ever carries its error.
    pub fn fail(&mut self, error: ExecutionError) -> Result<()> {
        self.guard(ContextState::Fail)?;
        self.result = None;
        self.error = Some(error);
        self.commit(ContextState::Fail);
        Ok(())
    }

    /// `READY -> CANCEL`: an orchestrator skips this context.
    pub fn cancel(&mut self) -> Result<()> {
        self.transition(ContextState::Cancel)
    }

    /// `DONE -> WORK`: the undo pass starts.
    pub fn begin_undo(&mut self) -> Result<()> {
        self.transition(ContextState::Work)
    }

    /// `WORK -> UNDONE`: the undo pass succeeded.
    pub fn mark_undone(&mut self) -> Result<()> {
        self.transition(ContextState::Undone)
    }

    /// Registers a listener for every following transition.
    pub fn add_listener(&mut self, listener: Arc<dyn StateChangeListener>) {
        self.listeners.push(listener);
    }

    /// Removes a listener registered with [`add_listener`](Self::add_listener).
    pub fn remove_listener(&mut self, listener: &Arc<dyn StateChangeListener>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let before = self.listeners.len();
        self.listeners
            .retain(|registered| Arc::as_ptr(registered) as *const () != target);
        self.listeners.len() != before
    }

    /// Runs `f` with `listener` registered, removing it afterwards.
    pub fn scoped<R>(
        &mut self,
        listener: &Arc<dyn StateChangeListener>,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        self.add_listener(Arc::clone(listener));
        let outcome = f(self);
        self.remove_listener(listener);
        outcome
    }

    fn transition(&mut self, next: ContextState) -> Result<()> {
        self.guard(next)?;
        self.commit(next);
        Ok(())
    }

    fn guard(&self, next: ContextState) -> Result<()> {
        // Work is entered from Ready by the do pass and from Done by the undo
        // pass; each pass may only settle in its own outcome.
        let pass_origin = self.history.last().copied();
        let allowed = self.state.permits(next)
            && match (self.state, next) {
                (ContextState::Work, ContextState::Done) => {
                    pass_origin == Some(ContextState::Ready)
                }
                (ContextState::Work, ContextState::Undone) => {
                    pass_origin == Some(ContextState::Done)
                }
                _ => true,
            };
        if allowed {
            Ok(())
        } else {
            Err(ExecutionError::IllegalTransition {
                context: self.id,
                from: self.state,
                to: next,
            })
        }
    }

    fn commit(&mut self, next: ContextState) {
        let previous = self.state;
        self.history.push(previous);
        self.state = next;
        tracing::trace!(
            context = %self.id,
            operation = %self.owner_id,
            from = %previous,
            to = %next,
            "context transition"
        );
        for listener in &self.listeners {
            listener.state_changed(self, previous);
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("state", &self.state)
            .field("redo_input", &self.redo_input)
            .field("undo_input", &self.undo_input)
            .field("result", &self.result)
            .field("error", &self.error)
            .field("history", &self.history)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Logs a transition that was refused by the state machine.
///
/// Used at operation boundaries, where an illegal transition means the
/// caller broke the contract and must not turn into a propagated error.
pub(crate) fn log_transition(outcome: Result<()>) {
    if let Err(error) = outcome {
        tracing::warn!(%error, "state transition refused");
    }
}
