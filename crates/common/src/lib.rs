//! Shared identifier types used across the orchestration workspace.

pub mod types;

pub use types::{ActionId, ContextId};
