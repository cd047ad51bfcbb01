//! Thread-bound transaction scopes and the decorator that opens them.
//!
//! A transaction belongs to the thread that began it. Registry writes check
//! for an open transaction on the current thread, so a write that escaped to
//! a worker thread is rejected instead of silently running unscoped.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use orchestration::{
    ContextState, ExecutionContext, Input, Operation, OperationDecorator, Result, SharedOperation,
};

thread_local! {
    static OPEN: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Id of the innermost transaction open on the current thread.
pub fn current_transaction() -> Option<u64> {
    OPEN.with(|open| open.borrow().last().copied())
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack,
}

/// Record of one finished transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub id: u64,
    pub operation: String,
    pub thread: ThreadId,
    pub outcome: Outcome,
}

/// Hands out transaction scopes and remembers how they ended.
#[derive(Debug, Default)]
pub struct TransactionManager {
    next_id: AtomicU64,
    finished: Mutex<Vec<TransactionRecord>>,
}

impl TransactionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Opens a transaction on the current thread.
    pub fn begin(self: &Arc<Self>, operation: &str) -> Transaction {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        OPEN.with(|open| open.borrow_mut().push(id));
        tracing::trace!(transaction = id, operation, "transaction begun");
        Transaction {
            id,
            operation: operation.to_string(),
            manager: Arc::clone(self),
            outcome: Outcome::RolledBack,
        }
    }

    /// Finished transactions, in completion order.
    pub fn finished(&self) -> Vec<TransactionRecord> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn finish(&self, record: TransactionRecord) {
        let counter = match record.outcome {
            Outcome::Committed => "school_transactions_committed_total",
            Outcome::RolledBack => "school_transactions_rolled_back_total",
        };
        metrics::counter!(counter).increment(1);
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

/// An open transaction. Rolls back on drop unless committed.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    operation: String,
    manager: Arc<TransactionManager>,
    outcome: Outcome,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn commit(mut self) {
        self.outcome = Outcome::Committed;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        OPEN.with(|open| {
            let mut open = open.borrow_mut();
            if let Some(position) = open.iter().rposition(|id| *id == self.id) {
                open.remove(position);
            }
        });
        tracing::trace!(transaction = self.id, outcome = ?self.outcome, "transaction finished");
        self.manager.finish(TransactionRecord {
            id: self.id,
            operation: std::mem::take(&mut self.operation),
            thread: thread::current().id(),
            outcome: self.outcome,
        });
    }
}

/// Runs every do and undo pass of an operation inside its own transaction.
pub struct Transactional {
    inner: SharedOperation,
    manager: Arc<TransactionManager>,
}

impl Transactional {
    /// Commits when `context` settled in `settled`, rolls back otherwise.
    fn run(
        &self,
        context: &mut ExecutionContext,
        settled: ContextState,
        pass: impl FnOnce(&mut ExecutionContext) -> Result<()>,
    ) -> Result<()> {
        let transaction = self.manager.begin(self.inner.id());
        let outcome = pass(context);
        if outcome.is_ok() && context.state() == settled {
            transaction.commit();
        }
        outcome
    }
}

impl Operation for Transactional {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn self_ref(&self) -> Result<SharedOperation> {
        self.inner.self_ref()
    }

    fn create_context(&self, input: Input) -> ExecutionContext {
        self.inner.create_context(input)
    }

    fn recreate_context(&self, spent: &ExecutionContext) -> ExecutionContext {
        self.inner.recreate_context(spent)
    }

    fn prefetch(&self, context: &mut ExecutionContext) -> Result<()> {
        self.inner.prefetch(context)
    }

    fn do_operation(&self, context: &mut ExecutionContext) -> Result<()> {
        self.run(context, ContextState::Done, |context| {
            self.inner.do_operation(context)
        })
    }

    fn undo_operation(&self, context: &mut ExecutionContext) -> Result<()> {
        self.run(context, ContextState::Undone, |context| {
            self.inner.undo_operation(context)
        })
    }
}

/// Decorator wrapping operations in [`Transactional`].
#[derive(Debug, Clone)]
pub struct TransactionalDecorator {
    manager: Arc<TransactionManager>,
}

impl TransactionalDecorator {
    pub fn new(manager: Arc<TransactionManager>) -> Self {
        Self { manager }
    }
}

impl OperationDecorator for TransactionalDecorator {
    fn decorate(&self, operation: SharedOperation) -> SharedOperation {
        Arc::new(Transactional {
            inner: operation,
            manager: Arc::clone(&self.manager),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scopes_nest_and_unwind() {
        let manager = TransactionManager::new();
        assert_eq!(current_transaction(), None);

        let outer = manager.begin("outer");
        let inner = manager.begin("inner");
        assert_eq!(current_transaction(), Some(inner.id()));
        inner.commit();
        assert_eq!(current_transaction(), Some(outer.id()));
        drop(outer);
        assert_eq!(current_transaction(), None);

        let outcomes: Vec<_> = manager.finished().into_iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![Outcome::Committed, Outcome::RolledBack]);
    }

    #[test]
    fn test_transactions_do_not_leak_across_threads() {
        let manager = TransactionManager::new();
        let _open = manager.begin("owner");
        let seen = thread::spawn(current_transaction).join().unwrap();
        assert_eq!(seen, None);
    }
}
