//! State change listeners and result bucketing for nested fan-out.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use common::ContextId;

use crate::context::ExecutionContext;
use crate::error::{ExecutionError, Result};
use crate::state::ContextState;

/// Observer of context transitions.
///
/// Called synchronously, in registration order, on the thread that performed
/// the transition and before control returns to it.
pub trait StateChangeListener: Send + Sync {
    fn state_changed(&self, context: &ExecutionContext, previous: ContextState);
}

/// A one-shot countdown latch.
///
/// Mutex + Condvar, released once the count reaches zero.
#[derive(Debug)]
pub struct CountDownLatch {
    remaining: Mutex<usize>,
    zero: Condvar,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Decrements the count, waking waiters when it reaches zero.
    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock().unwrap_or_else(PoisonError::into_inner);
        if *remaining > 0 {
            *remaining -= 1;
            if *remaining == 0 {
                self.zero.notify_all();
            }
        }
    }

    pub fn count(&self) -> usize {
        *self.remaining.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the count reaches zero.
    ///
    /// Returns false if `timeout` elapsed first; `None` waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let mut remaining = self.remaining.lock().unwrap_or_else(PoisonError::into_inner);
        while *remaining > 0 {
            match deadline {
                None => {
                    remaining = self
                        .zero
                        .wait(remaining)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    remaining = self
                        .zero
                        .wait_timeout(remaining, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    Context(ContextId),
    Missing(usize),
}

/// Partitions nested contexts into succeeded and failed buckets.
///
/// Registered on every nested context for the duration of one fan-out. Each
/// nested slot counts the latch down exactly once: when its context settles,
/// when [`admit`](Self::admit) finds it cannot run at all, or when
/// [`record_missing`](Self::record_missing) finds the executor lost it.
/// Whatever is still outstanding after a timed-out [`wait`](Self::wait) is
/// settled as failed by [`reconcile`](Self::reconcile).
#[derive(Debug)]
pub struct ResultBuckets {
    succeeded: Mutex<Vec<ContextId>>,
    failed: Mutex<Vec<ContextId>>,
    missing: Mutex<Vec<usize>>,
    seen: Mutex<HashSet<Slot>>,
    latch: CountDownLatch,
}

impl ResultBuckets {
    /// Creates buckets expecting `expected` nested slots.
    pub fn new(expected: usize) -> Self {
        Self {
            succeeded: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
            missing: Mutex::new(Vec::new()),
            seen: Mutex::new(HashSet::new()),
            latch: CountDownLatch::new(expected),
        }
    }

    /// Accounts, before the fan-out, for contexts no executor will start.
    ///
    /// Only `READY` contexts run, so anything else (failed at build time,
    /// already settled) would never reach the latch through a transition.
    pub fn admit(&self, contexts: &[ExecutionContext]) {
        for context in contexts {
            if !context.state().can_start() {
                self.record(context, true);
            }
        }
    }

    /// Accounts for slots the executor returned without a context.
    pub fn record_missing(&self, results: &[Option<ExecutionContext>]) {
        for (index, slot) in results.iter().enumerate() {
            if slot.is_none() && self.mark_seen(Slot::Missing(index)) {
                lock(&self.missing).push(index);
                self.latch.count_down();
            }
        }
    }

    /// Settles every slot not yet accounted for; unsettled contexts count
    /// as failed.
    pub fn reconcile(&self, results: &[Option<ExecutionContext>]) {
        self.record_missing(results);
        for context in results.iter().flatten() {
            self.record(context, true);
        }
    }

    /// Blocks until every expected slot has been accounted for.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        if self.latch.wait(timeout) {
            Ok(())
        } else {
            Err(ExecutionError::Timeout {
                waiting_for: "nested result buckets",
                elapsed: timeout.unwrap_or_default(),
            })
        }
    }

    /// Slots not yet accounted for.
    pub fn outstanding(&self) -> usize {
        self.latch.count()
    }

    /// Contexts that settled in `DONE`, in completion order.
    pub fn succeeded(&self) -> Vec<ContextId> {
        lock(&self.succeeded).clone()
    }

    /// Contexts that settled in `FAIL` or `CANCEL`, in completion order.
    pub fn failed(&self) -> Vec<ContextId> {
        lock(&self.failed).clone()
    }

    /// Positions of slots that produced no context.
    pub fn missing(&self) -> Vec<usize> {
        lock(&self.missing).clone()
    }

    pub fn is_succeeded(&self, id: ContextId) -> bool {
        lock(&self.succeeded).contains(&id)
    }

    /// With `last_word`, a context that never settled counts as failed.
    fn record(&self, context: &ExecutionContext, last_word: bool) {
        let succeeded = match context.state() {
            ContextState::Done => true,
            ContextState::Fail | ContextState::Cancel => false,
            _ if last_word => false,
            _ => return,
        };
        if !self.mark_seen(Slot::Context(context.id())) {
            return;
        }
        if succeeded {
            lock(&self.succeeded).push(context.id());
        } else {
            lock(&self.failed).push(context.id());
        }
        self.latch.count_down();
    }

    fn mark_seen(&self, slot: Slot) -> bool {
        lock(&self.seen).insert(slot)
    }
}

impl StateChangeListener for ResultBuckets {
    fn state_changed(&self, context: &ExecutionContext, _previous: ContextState) {
        self.record(context, false);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
