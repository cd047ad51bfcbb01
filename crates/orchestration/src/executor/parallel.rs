//! Concurrent fan-out over a worker pool.
//!
//! Each nested context gets its own worker task. Resource-free preparation
//! (`prefetch`) runs on the worker; the operation itself is relayed back to
//! the thread that called the executor, so anything bound to that thread
//! (a transaction, a session) covers every nested operation. The calling
//! thread must not be inside an async context.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use super::{NestedExecutor, NestedResults, Pass, prefetch, resolve_owner};
use crate::action::{ActionContextPropagator, NoopPropagator};
use crate::composite::MacroHooks;
use crate::config::OrchestrationConfig;
use crate::context::ExecutionContext;
use crate::error::{ExecutionError, Result};
use crate::listener::StateChangeListener;
use crate::pool::{WorkerPool, block_on_bounded};
use crate::relay::{ActionRelay, RelayError, RelayRequester};
use crate::state::ContextState;

/// What a worker task hands back to the owner.
struct TaskOutcome {
    context: Option<ExecutionContext>,
    fatal: Option<ExecutionError>,
}

impl TaskOutcome {
    fn settled(context: ExecutionContext) -> Self {
        Self {
            context: Some(context),
            fatal: None,
        }
    }
}

/// Runs nested contexts concurrently; results keep submission order.
///
/// Nesting a parallel composite inside another one needs a pool larger than
/// the outer fan-out, otherwise inner tasks queue behind outer tasks that
/// are waiting on the relay, until the relay timeout fires.
pub struct ParallelExecutor {
    pool: Arc<WorkerPool>,
    propagator: Arc<dyn ActionContextPropagator>,
    relay_timeout: Option<Duration>,
}

impl ParallelExecutor {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            propagator: Arc::new(NoopPropagator),
            relay_timeout: OrchestrationConfig::default().relay_timeout,
        }
    }

    pub fn from_config(pool: Arc<WorkerPool>, config: &OrchestrationConfig) -> Self {
        Self::new(pool).with_relay_timeout(config.relay_timeout)
    }

    pub fn with_propagator(mut self, propagator: Arc<dyn ActionContextPropagator>) -> Self {
        self.propagator = propagator;
        self
    }

    pub fn with_relay_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.relay_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    fn fan_out(
        &self,
        contexts: Vec<ExecutionContext>,
        listener: Option<&Arc<dyn StateChangeListener>>,
        pass: Pass,
    ) -> Result<NestedResults> {
        let total = contexts.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let relay = ActionRelay::new(total, self.pool.handle().clone(), self.relay_timeout);
        let action = self.propagator.capture();
        let span = tracing::Span::current();

        let mut pending = Vec::with_capacity(total);
        for context in contexts {
            let (report, outcome) = oneshot::channel();
            pending.push(outcome);

            let requester = relay.requester();
            let propagator = Arc::clone(&self.propagator);
            let listener = listener.cloned();
            let action = action.clone();
            let span = span.clone();
            self.pool.submit(move || {
                let _entered = span.enter();
                if let Some(action) = &action {
                    propagator.install(action);
                }
                let outcome = run_task(context, listener, pass, &requester);
                drop(requester);
                if action.is_some() {
                    propagator.release();
                }
                // The owner may have given up on this task after a fatal error.
                let _ = report.send(outcome);
            });
        }

        let mut fatal = match relay.serve(total) {
            Ok(served) => {
                tracing::debug!(served, total, ?pass, "fan-out relayed");
                None
            }
            Err(error) => {
                tracing::error!(%error, total, ?pass, "relay aborted");
                Some(error)
            }
        };

        let mut results = Vec::with_capacity(total);
        for (index, outcome) in pending.into_iter().enumerate() {
            let joined =
                block_on_bounded(self.pool.handle(), self.relay_timeout, "nested task", outcome);
            match joined {
                Ok(Ok(outcome)) => {
                    if fatal.is_none() {
                        fatal = outcome.fatal;
                    }
                    results.push(outcome.context);
                }
                Ok(Err(_)) => {
                    tracing::warn!(index, "nested task ended without reporting");
                    results.push(None);
                }
                Err(error) => {
                    tracing::warn!(index, %error, "nested task did not report in time");
                    fatal.get_or_insert(error);
                    results.push(None);
                }
            }
        }

        match fatal {
            Some(error) => {
                if pass == Pass::Do {
                    revert_applied(results);
                }
                Err(error)
            }
            None => Ok(results),
        }
    }
}

/// Undoes, on the calling thread, every context a fatally aborted do pass
/// left `DONE`. The batch is discarded, so nothing else could compensate it.
fn revert_applied(results: NestedResults) {
    for mut context in results.into_iter().flatten() {
        if !context.state().can_undo() {
            continue;
        }
        let Some(operation) = resolve_owner(&mut context) else {
            continue;
        };
        match Pass::Undo.run(operation.as_ref(), &mut context, None) {
            Ok(()) if context.state() == ContextState::Undone => {
                metrics::counter!("orchestration_compensations_total").increment(1);
            }
            Ok(()) => {
                metrics::counter!("orchestration_rollback_failures_total").increment(1);
                tracing::error!(
                    operation = context.owner_id(),
                    context = %context.id(),
                    state = %context.state(),
                    "could not revert nested operation after abort"
                );
            }
            Err(error) => {
                tracing::error!(operation = context.owner_id(), %error, "revert aborted");
            }
        }
    }
}

impl NestedExecutor for ParallelExecutor {
    #[tracing::instrument(skip_all, fields(nested = contexts.len()))]
    fn execute_nested(
        &self,
        contexts: Vec<ExecutionContext>,
        listener: &Arc<dyn StateChangeListener>,
        _hooks: &dyn MacroHooks,
    ) -> Result<NestedResults> {
        self.fan_out(contexts, Some(listener), Pass::Do)
    }

    #[tracing::instrument(skip_all, fields(nested = contexts.len()))]
    fn rollback_nested(&self, contexts: Vec<ExecutionContext>) -> Result<NestedResults> {
        self.fan_out(contexts, None, Pass::Undo)
    }
}

/// Worker half of one nested context: prepare here, execute on the owner.
fn run_task(
    mut context: ExecutionContext,
    listener: Option<Arc<dyn StateChangeListener>>,
    pass: Pass,
    requester: &RelayRequester,
) -> TaskOutcome {
    if let Some(listener) = &listener {
        context.add_listener(Arc::clone(listener));
    }
    let detach = |mut context: ExecutionContext| {
        if let Some(listener) = &listener {
            context.remove_listener(listener);
        }
        context
    };

    let Some(operation) = resolve_owner(&mut context) else {
        return TaskOutcome::settled(detach(context));
    };
    let runnable = match pass {
        Pass::Do => prefetch(operation.as_ref(), &mut context),
        Pass::Undo => true,
    };
    let startable = match pass {
        Pass::Do => context.state().can_start(),
        Pass::Undo => context.state().can_undo(),
    };
    if !runnable || !startable {
        return TaskOutcome::settled(detach(context));
    }

    let owner_id = operation.id().to_string();
    let relayed = requester.request(move || {
        let fatal = pass.run(operation.as_ref(), &mut context, None).err();
        (context, fatal)
    });
    match relayed {
        Ok((context, fatal)) => TaskOutcome {
            context: Some(detach(context)),
            fatal,
        },
        Err(RelayError::Panicked(message)) => {
            metrics::counter!("orchestration_relay_panics_total").increment(1);
            tracing::warn!(operation = %owner_id, %message, "nested operation panicked");
            TaskOutcome {
                context: None,
                fatal: None,
            }
        }
        Err(RelayError::Fatal(error)) => {
            tracing::error!(operation = %owner_id, %error, "relay failed");
            TaskOutcome {
                context: None,
                fatal: Some(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::FinalResult;
    use crate::context::Input;
    use crate::listener::ResultBuckets;
    use crate::operation::{Command, Executed, Leaf, SharedOperation};
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};

    type ThreadLog = Arc<Mutex<Vec<ThreadId>>>;

    struct Tracked {
        name: String,
        threads: ThreadLog,
        fail: bool,
    }

    impl Command for Tracked {
        fn name(&self) -> &str {
            &self.name
        }

        fn execute(&self, input: &Value) -> Result<Executed> {
            self.threads.lock().unwrap().push(thread::current().id());
            if self.fail {
                return Err(ExecutionError::rejected(&self.name, "refused"));
            }
            Ok(Executed::new(input.clone(), Value::Null))
        }

        fn rollback(&self, _undo: &Value) -> Result<()> {
            self.threads.lock().unwrap().push(thread::current().id());
            Ok(())
        }
    }

    fn tracked(count: usize, failing: Option<usize>) -> (Vec<SharedOperation>, ThreadLog) {
        let threads = Arc::new(Mutex::new(Vec::new()));
        let ops = (0..count)
            .map(|i| {
                Leaf::shared(Tracked {
                    name: format!("tracked-{i}"),
                    threads: Arc::clone(&threads),
                    fail: failing == Some(i),
                })
            })
            .collect();
        (ops, threads)
    }

    fn executor() -> ParallelExecutor {
        let pool = Arc::new(WorkerPool::new(4, "parallel-test").unwrap());
        ParallelExecutor::new(pool).with_relay_timeout(Some(Duration::from_secs(5)))
    }

    #[test]
    fn test_operations_run_on_calling_thread_in_submission_order() {
        let (ops, threads) = tracked(4, None);
        let contexts = ops
            .iter()
            .enumerate()
            .map(|(i, op)| op.create_context(Input::Value(json!(i))))
            .collect();
        let buckets = Arc::new(ResultBuckets::new(4));
        let listener: Arc<dyn StateChangeListener> = buckets.clone();

        let results = executor()
            .execute_nested(contexts, &listener, &FinalResult::LastResult)
            .unwrap();

        let values: Vec<_> = results
            .iter()
            .map(|slot| slot.as_ref().unwrap().result().cloned())
            .collect();
        assert_eq!(values, (0..4).map(|i| Some(json!(i))).collect::<Vec<_>>());
        assert_eq!(buckets.succeeded().len(), 4);

        let owner = thread::current().id();
        assert!(threads.lock().unwrap().iter().all(|id| *id == owner));
    }

    #[test]
    fn test_failed_nested_context_lands_in_failed_bucket() {
        let (ops, _) = tracked(3, Some(1));
        let contexts = ops
            .iter()
            .map(|op| op.create_context(Input::Value(json!(1))))
            .collect();
        let buckets = Arc::new(ResultBuckets::new(3));
        let listener: Arc<dyn StateChangeListener> = buckets.clone();

        let results = executor()
            .execute_nested(contexts, &listener, &FinalResult::LastResult)
            .unwrap();

        assert_eq!(results[1].as_ref().unwrap().state(), ContextState::Fail);
        assert_eq!(buckets.failed(), vec![results[1].as_ref().unwrap().id()]);
        assert_eq!(buckets.succeeded().len(), 2);
    }

    #[test]
    fn test_rollback_relays_to_calling_thread() {
        let (ops, threads) = tracked(2, None);
        let contexts = ops
            .iter()
            .map(|op| op.create_context(Input::Value(json!(1))))
            .collect();
        let buckets = Arc::new(ResultBuckets::new(2));
        let listener: Arc<dyn StateChangeListener> = buckets.clone();
        let executor = executor();
        let done: Vec<_> = executor
            .execute_nested(contexts, &listener, &FinalResult::LastResult)
            .unwrap()
            .into_iter()
            .flatten()
            .collect();

        let undone = executor.rollback_nested(done).unwrap();

        assert!(undone.iter().flatten().all(|c| c.state() == ContextState::Undone));
        let owner = thread::current().id();
        assert_eq!(threads.lock().unwrap().len(), 4);
        assert!(threads.lock().unwrap().iter().all(|id| *id == owner));
    }

    #[test]
    fn test_empty_fan_out() {
        let buckets: Arc<dyn StateChangeListener> = Arc::new(ResultBuckets::new(0));
        let results = executor()
            .execute_nested(Vec::new(), &buckets, &FinalResult::LastResult)
            .unwrap();
        assert!(results.is_empty());
    }
}
