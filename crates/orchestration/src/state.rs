//! Execution context state machine.

use serde::{Deserialize, Serialize};

/// The lifecycle state of an [`ExecutionContext`](crate::ExecutionContext).
///
/// State transitions:
/// ```text
/// Init ──► Ready ──► Work ──┬──► Done ──► Work ──┬──► Undone
///   │        │              │    (undo pass)     └──► Fail
///   │        │              └──► Fail
///   │        ├──► Cancel
///   └────────┴──► Fail
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextState {
    /// Context built, parameter not yet validated.
    #[default]
    Init,

    /// Parameter validated, waiting to run.
    Ready,

    /// A do or undo pass is running.
    Work,

    /// The do pass completed successfully.
    Done,

    /// A pass failed; the error is recorded on the context (terminal state).
    Fail,

    /// The undo pass completed successfully (terminal state).
    Undone,

    /// Skipped by an orchestrator before it ran (terminal state).
    Cancel,
}

impl ContextState {
    /// Returns true if the edge `self -> next` is listed in the transition table.
    ///
    /// `Work -> Done` and `Work -> Undone` are both listed here; which one is
    /// allowed depends on the pass that entered `Work`, which only the context
    /// history knows.
    pub fn permits(&self, next: ContextState) -> bool {
        use ContextState::*;
        matches!(
            (self, next),
            (Init, Ready)
                | (Init, Fail)
                | (Ready, Work)
                | (Ready, Cancel)
                | (Ready, Fail)
                | (Work, Done)
                | (Work, Fail)
                | (Work, Undone)
                | (Done, Work)
        )
    }

    /// Returns true if a do pass may start from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, ContextState::Ready)
    }

    /// Returns true if an orchestrator may cancel a context in this state.
    pub fn can_cancel(&self) -> bool {
        matches!(self, ContextState::Ready)
    }

    /// Returns true if an undo pass may start from this state.
    pub fn can_undo(&self) -> bool {
        matches!(self, ContextState::Done)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextState::Init => "INIT",
            ContextState::Ready => "READY",
            ContextState::Work => "WORK",
            ContextState::Done => "DONE",
            ContextState::Fail => "FAIL",
            ContextState::Undone => "UNDONE",
            ContextState::Cancel => "CANCEL",
        }
    }
}

impl std::fmt::Display for ContextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
