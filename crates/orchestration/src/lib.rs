//! Reversible command execution and saga orchestration.
//!
//! Every operation invocation is tracked by an [`ExecutionContext`] that moves
//! through a fixed lifecycle (`INIT → READY → WORK → DONE/FAIL`, and
//! `DONE → WORK → UNDONE/FAIL` for rollback). Operations can be composed:
//!
//! 1. A [`Leaf`] adapts a [`Command`] (business logic plus its rollback).
//! 2. A [`CompositeOperation`] runs its nested operations all-or-nothing,
//!    either one after another ([`SequentialExecutor`]) or fanned out over a
//!    [`WorkerPool`] ([`ParallelExecutor`]).
//!
//! If any nested operation fails, the composite fails and every nested
//! operation that already succeeded is rolled back.

pub mod action;
pub mod composite;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod listener;
pub mod operation;
pub mod pool;
pub mod relay;
pub mod state;

pub use action::{ActionContext, ActionContextPropagator, NoopPropagator, ThreadLocalPropagator};
pub use composite::{CompositeOperation, CompositeSettings, FinalResult, MacroHooks};
pub use config::{OrchestrationConfig, RollbackFailurePolicy};
pub use context::{ExecutionContext, Input, MacroExecutionParameter};
pub use error::{ExecutionError, Result};
pub use executor::{NestedExecutor, NestedResults, ParallelExecutor, SequentialExecutor};
pub use listener::{CountDownLatch, ResultBuckets, StateChangeListener};
pub use operation::{
    Command, Executed, Leaf, Operation, OperationDecorator, SelfRef, SharedOperation, Undecorated,
    wire,
};
pub use pool::WorkerPool;
pub use relay::{ActionRelay, RelayError, RelayRequester};
pub use state::ContextState;
