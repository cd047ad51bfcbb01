//! Shared fixtures for orchestration integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::thread::{self, ThreadId};
use std::time::Duration;

use orchestration::{
    Command, CompositeOperation, CompositeSettings, ContextState, ExecutionContext,
    ExecutionError, Executed, FinalResult, Input, Leaf, MacroHooks, NestedExecutor, Operation,
    OrchestrationConfig, ParallelExecutor, Result, RollbackFailurePolicy, SequentialExecutor,
    SharedOperation, StateChangeListener, Undecorated, WorkerPool, wire,
};
use serde_json::{Value, json};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Prefetch,
    Do,
    Undo,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub operation: String,
    pub step: Step,
    pub thread: ThreadId,
}

/// Ordered log of every command step, shared by all recording commands.
#[derive(Debug, Default)]
pub struct Journal {
    entries: Mutex<Vec<Entry>>,
}

impl Journal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, operation: &str, step: Step) {
        self.entries.lock().unwrap().push(Entry {
            operation: operation.to_string(),
            step,
            thread: thread::current().id(),
        });
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.entries.lock().unwrap().clone()
    }

    /// Operation names that ran `step`, in order.
    pub fn ran(&self, step: Step) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.step == step)
            .map(|entry| entry.operation)
            .collect()
    }

    pub fn threads(&self, step: Step) -> Vec<ThreadId> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.step == step)
            .map(|entry| entry.thread)
            .collect()
    }
}

/// Command that records what it does and misbehaves on request.
pub struct Recording {
    name: String,
    journal: Arc<Journal>,
    reject_input: bool,
    fail: bool,
    panic: bool,
    fail_rollback: bool,
    prefetch_delay: Duration,
    execute_delay: Duration,
}

impl Recording {
    pub fn new(name: impl Into<String>, journal: &Arc<Journal>) -> Self {
        Self {
            name: name.into(),
            journal: Arc::clone(journal),
            reject_input: false,
            fail: false,
            panic: false,
            fail_rollback: false,
            prefetch_delay: Duration::ZERO,
            execute_delay: Duration::ZERO,
        }
    }

    pub fn rejecting_input(mut self) -> Self {
        self.reject_input = true;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }

    pub fn failing_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    pub fn with_prefetch_delay(mut self, delay: Duration) -> Self {
        self.prefetch_delay = delay;
        self
    }

    pub fn with_execute_delay(mut self, delay: Duration) -> Self {
        self.execute_delay = delay;
        self
    }

    pub fn shared(self) -> SharedOperation {
        Leaf::shared(self)
    }
}

impl Command for Recording {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, input: &Input) -> Result<()> {
        if self.reject_input {
            return Err(ExecutionError::invalid_input(&self.name, "rejected by test"));
        }
        match input {
            Input::Value(_) => Ok(()),
            _ => Err(ExecutionError::invalid_input(&self.name, "expected a payload")),
        }
    }

    fn prefetch(&self, _input: &mut Input) -> Result<()> {
        self.journal.push(&self.name, Step::Prefetch);
        if !self.prefetch_delay.is_zero() {
            thread::sleep(self.prefetch_delay);
        }
        Ok(())
    }

    fn execute(&self, input: &Value) -> Result<Executed> {
        if !self.execute_delay.is_zero() {
            thread::sleep(self.execute_delay);
        }
        self.journal.push(&self.name, Step::Do);
        if self.panic {
            panic!("{} blew up", self.name);
        }
        if self.fail {
            return Err(ExecutionError::rejected(&self.name, "failing by test"));
        }
        Ok(Executed::new(
            json!({ "by": self.name, "input": input }),
            json!({ "undo": self.name }),
        ))
    }

    fn rollback(&self, _undo: &Value) -> Result<()> {
        self.journal.push(&self.name, Step::Undo);
        if self.fail_rollback {
            return Err(ExecutionError::rollback_failed(&self.name, "failing by test"));
        }
        Ok(())
    }
}

/// Sequential hooks that feed each step the previous step's result.
pub struct Chain(pub FinalResult);

impl MacroHooks for Chain {
    fn transfer_result(
        &self,
        _previous: &dyn Operation,
        previous_result: &Value,
        current: &mut ExecutionContext,
    ) -> Result<()> {
        *current.redo_input_mut()? = Input::Value(previous_result.clone());
        Ok(())
    }

    fn final_result(&self, contexts: &[ExecutionContext]) -> Result<Value> {
        self.0.compute(contexts)
    }
}

pub fn settings(policy: RollbackFailurePolicy) -> CompositeSettings {
    CompositeSettings {
        latch_timeout: Some(Duration::from_secs(5)),
        rollback_policy: policy,
    }
}

pub fn composite(
    id: &str,
    executor: Arc<dyn NestedExecutor>,
    hooks: Arc<dyn MacroHooks>,
    nested: Vec<SharedOperation>,
    policy: RollbackFailurePolicy,
) -> SharedOperation {
    wire(&Undecorated, |self_ref| {
        CompositeOperation::new(id, self_ref, executor, hooks)
            .with_settings(settings(policy))
            .with_nested(nested)
    })
}

pub fn sequential(id: &str, nested: Vec<SharedOperation>) -> SharedOperation {
    composite(
        id,
        Arc::new(SequentialExecutor),
        Arc::new(Chain(FinalResult::LastResult)),
        nested,
        RollbackFailurePolicy::Reapply,
    )
}

pub fn pool(size: usize) -> Arc<WorkerPool> {
    let config = OrchestrationConfig {
        pool_size: size,
        thread_name: "orchestration-test".to_string(),
        ..OrchestrationConfig::default()
    };
    Arc::new(WorkerPool::from_config(&config).unwrap())
}

pub fn parallel_executor(size: usize) -> Arc<dyn NestedExecutor> {
    Arc::new(ParallelExecutor::new(pool(size)).with_relay_timeout(Some(Duration::from_secs(5))))
}

pub fn parallel(id: &str, size: usize, nested: Vec<SharedOperation>) -> SharedOperation {
    composite(
        id,
        parallel_executor(size),
        Arc::new(FinalResult::LastResult),
        nested,
        RollbackFailurePolicy::Reapply,
    )
}

/// Builds a context for `operation` and runs its do pass.
pub fn run(operation: &SharedOperation, payload: Value) -> ExecutionContext {
    let mut context = operation.create_context(Input::Value(payload));
    operation.do_operation(&mut context).unwrap();
    context
}

/// States of the nested contexts held by `input`, in slot order.
pub fn nested_states(input: Option<&Input>) -> Vec<Option<ContextState>> {
    input
        .and_then(Input::as_macro)
        .map(|parameter| parameter.states())
        .unwrap_or_default()
}

/// Listener recording every `(previous, next)` pair it observes.
#[derive(Default)]
pub struct TransitionLog {
    seen: Mutex<Vec<(ContextState, ContextState)>>,
}

impl TransitionLog {
    pub fn transitions(&self) -> Vec<(ContextState, ContextState)> {
        self.seen.lock().unwrap().clone()
    }
}

impl StateChangeListener for TransitionLog {
    fn state_changed(&self, context: &ExecutionContext, previous: ContextState) {
        self.seen.lock().unwrap().push((previous, context.state()));
    }
}
