//! Cross-cutting action context carried from the caller onto worker threads.

use std::cell::RefCell;

use chrono::{DateTime, Utc};
use common::ActionId;
use serde::{Deserialize, Serialize};

/// Identity of the external request a batch of operations runs for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionContext {
    pub id: ActionId,
    pub name: String,
    pub started_at: DateTime<Utc>,
}

impl ActionContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ActionId::new(),
            name: name.into(),
            started_at: Utc::now(),
        }
    }
}

/// Moves the current action context across threads.
///
/// `capture` runs on the submitting thread; `install` and `release` bracket
/// the work on each worker thread.
pub trait ActionContextPropagator: Send + Sync {
    fn capture(&self) -> Option<ActionContext>;

    fn install(&self, context: &ActionContext);

    fn release(&self);
}

/// Propagator for callers that carry no action context.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPropagator;

impl ActionContextPropagator for NoopPropagator {
    fn capture(&self) -> Option<ActionContext> {
        None
    }

    fn install(&self, _context: &ActionContext) {}

    fn release(&self) {}
}

thread_local! {
    static CURRENT: RefCell<Option<ActionContext>> = const { RefCell::new(None) };
}

/// Propagator backed by a thread-local slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLocalPropagator;

impl ThreadLocalPropagator {
    /// The action context installed on the current thread.
    pub fn current() -> Option<ActionContext> {
        CURRENT.with(|slot| slot.borrow().clone())
    }

    /// Installs `context` on the current thread, returning the previous one.
    pub fn enter(context: ActionContext) -> Option<ActionContext> {
        CURRENT.with(|slot| slot.borrow_mut().replace(context))
    }

    /// Clears the current thread's action context.
    pub fn exit() -> Option<ActionContext> {
        CURRENT.with(|slot| slot.borrow_mut().take())
    }
}

impl ActionContextPropagator for ThreadLocalPropagator {
    fn capture(&self) -> Option<ActionContext> {
        Self::current()
    }

    fn install(&self, context: &ActionContext) {
        Self::enter(context.clone());
    }

    fn release(&self) {
        Self::exit();
    }
}
