//! Composite (macro) operations: all-or-nothing execution of nested operations.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::{OrchestrationConfig, RollbackFailurePolicy};
use crate::context::{ExecutionContext, Input, MacroExecutionParameter, log_transition};
use crate::error::{ExecutionError, Result};
use crate::executor::{NestedExecutor, NestedResults, prefetch};
use crate::listener::{ResultBuckets, StateChangeListener};
use crate::operation::{Operation, SelfRef, SharedOperation};
use crate::state::ContextState;

/// Per-macro-operation extension points.
pub trait MacroHooks: Send + Sync {
    /// Builds the context of one nested operation from the macro input.
    fn prepare_nested_context(&self, nested: &SharedOperation, input: &Input) -> ExecutionContext {
        nested.create_context(input.clone())
    }

    /// Copies what step *n* needs from the result of step *n - 1*.
    ///
    /// Only sequential execution calls this. There is no sensible default:
    /// every sequential macro-operation must state its data dependency.
    fn transfer_result(
        &self,
        previous: &dyn Operation,
        _previous_result: &Value,
        current: &mut ExecutionContext,
    ) -> Result<()> {
        Err(ExecutionError::CannotTransferResult {
            from: previous.id().to_string(),
            to: current.owner_id().to_string(),
        })
    }

    /// Aggregates the nested results into the macro result.
    fn final_result(&self, contexts: &[ExecutionContext]) -> Result<Value> {
        FinalResult::LastResult.compute(contexts)
    }
}

/// Ready-made aggregation strategies for [`MacroHooks::final_result`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FinalResult {
    /// The result of the last nested context.
    #[default]
    LastResult,

    /// Logical AND of boolean nested results (e.g. a delete fan-out).
    AllTrue,

    /// The result of the context owned by the named nested operation.
    OwnedBy(String),
}

impl FinalResult {
    pub fn compute(&self, contexts: &[ExecutionContext]) -> Result<Value> {
        match self {
            FinalResult::LastResult => Ok(contexts
                .last()
                .and_then(ExecutionContext::result)
                .cloned()
                .unwrap_or(Value::Null)),
            FinalResult::AllTrue => {
                let mut all = true;
                for context in contexts {
                    match context.result() {
                        Some(Value::Bool(flag)) => all &= *flag,
                        other => {
                            return Err(ExecutionError::rejected(
                                context.owner_id(),
                                format!("expected a boolean result, got {other:?}"),
                            ));
                        }
                    }
                }
                Ok(Value::Bool(all))
            }
            FinalResult::OwnedBy(owner) => contexts
                .iter()
                .find(|context| context.owner_id() == owner)
                .and_then(ExecutionContext::result)
                .cloned()
                .ok_or_else(|| {
                    ExecutionError::rejected(owner.clone(), "no result from this nested operation")
                }),
        }
    }
}

impl MacroHooks for FinalResult {
    fn final_result(&self, contexts: &[ExecutionContext]) -> Result<Value> {
        self.compute(contexts)
    }
}

/// Waits and policies applied by a [`CompositeOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeSettings {
    pub latch_timeout: Option<Duration>,
    pub rollback_policy: RollbackFailurePolicy,
}

impl Default for CompositeSettings {
    fn default() -> Self {
        Self::from(&OrchestrationConfig::default())
    }
}

impl From<&OrchestrationConfig> for CompositeSettings {
    fn from(config: &OrchestrationConfig) -> Self {
        Self {
            latch_timeout: config.latch_timeout,
            rollback_policy: config.rollback_policy,
        }
    }
}

/// An operation made of an ordered list of nested operations.
///
/// The parent context's redo input carries one nested context per nested
/// operation. Execution is all-or-nothing: if any nested context fails, the
/// parent fails and every nested context that succeeded is rolled back.
pub struct CompositeOperation {
    id: String,
    self_ref: SelfRef,
    nested: Mutex<Vec<SharedOperation>>,
    executor: Arc<dyn NestedExecutor>,
    hooks: Arc<dyn MacroHooks>,
    settings: CompositeSettings,
}

impl CompositeOperation {
    pub fn new(
        id: impl Into<String>,
        self_ref: SelfRef,
        executor: Arc<dyn NestedExecutor>,
        hooks: Arc<dyn MacroHooks>,
    ) -> Self {
        Self {
            id: id.into(),
            self_ref,
            nested: Mutex::new(Vec::new()),
            executor,
            hooks,
            settings: CompositeSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: CompositeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Appends nested operations, in execution order.
    pub fn with_nested(self, operations: impl IntoIterator<Item = SharedOperation>) -> Self {
        for operation in operations {
            self.register(operation);
        }
        self
    }

    /// Appends one nested operation. Meant for construction time only.
    pub fn register(&self, operation: SharedOperation) {
        self.nested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(operation);
    }

    /// Snapshot of the nested operations.
    pub fn nested(&self) -> Vec<SharedOperation> {
        self.nested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn settings(&self) -> CompositeSettings {
        self.settings
    }

    /// Rolls back every nested context still in `DONE`, keeping positions.
    fn compensate(&self, mut slots: NestedResults) -> Result<NestedResults> {
        let mut positions = Vec::new();
        let mut done = Vec::new();
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot
                .as_ref()
                .is_some_and(|context| context.state() == ContextState::Done)
                && let Some(context) = slot.take()
            {
                positions.push(index);
                done.push(context);
            }
        }
        if done.is_empty() {
            return Ok(slots);
        }

        metrics::counter!("orchestration_compensations_total").increment(1);
        tracing::info!(
            operation = %self.id,
            compensating = done.len(),
            "rolling back succeeded nested contexts"
        );
        let rolled_back = self.executor.rollback_nested(done)?;
        let failures = rolled_back
            .iter()
            .filter(|slot| {
                !slot
                    .as_ref()
                    .is_some_and(|context| context.state() == ContextState::Undone)
            })
            .count();
        if failures > 0 {
            metrics::counter!("orchestration_rollback_failures_total").increment(failures as u64);
            tracing::warn!(operation = %self.id, failures, "compensation left contexts behind");
        }

        for (index, context) in positions.into_iter().zip(rolled_back) {
            slots[index] = context;
        }
        Ok(slots)
    }

    /// Settles nested contexts after one of their rollbacks failed.
    ///
    /// Under [`RollbackFailurePolicy::Reapply`] every nested context whose
    /// rollback succeeded is executed forward again, through a fresh context,
    /// so the composite is not left half undone.
    fn after_rollback_processing(&self, mut slots: NestedResults) -> Result<NestedResults> {
        if self.settings.rollback_policy == RollbackFailurePolicy::Report {
            return Ok(slots);
        }

        for slot in slots.iter_mut() {
            let Some(spent) = slot.as_ref() else {
                continue;
            };
            if spent.state() != ContextState::Undone {
                continue;
            }
            let Some(operation) = spent.owner() else {
                tracing::warn!(operation = spent.owner_id(), "cannot reapply, owner is gone");
                continue;
            };

            let mut fresh = operation.recreate_context(spent);
            if prefetch(operation.as_ref(), &mut fresh) {
                operation.do_operation(&mut fresh)?;
            }
            if fresh.state() == ContextState::Done {
                tracing::info!(operation = operation.id(), "reapplied nested operation");
            } else {
                tracing::error!(
                    operation = operation.id(),
                    state = %fresh.state(),
                    "reapplying nested operation failed"
                );
            }
            *slot = Some(fresh);
        }
        Ok(slots)
    }
}

impl Operation for CompositeOperation {
    fn id(&self) -> &str {
        &self.id
    }

    fn self_ref(&self) -> Result<SharedOperation> {
        self.self_ref.get(&self.id)
    }

    fn create_context(&self, input: Input) -> ExecutionContext {
        let parameter = match input {
            Input::Macro(parameter) => parameter,
            input => {
                let nested = self.nested();
                if nested.is_empty() {
                    return ExecutionContext::for_operation(self, input).validated(Err(
                        ExecutionError::invalid_input(&self.id, "no nested operations"),
                    ));
                }
                MacroExecutionParameter::new(
                    nested
                        .iter()
                        .map(|operation| self.hooks.prepare_nested_context(operation, &input))
                        .collect(),
                )
            }
        };
        ExecutionContext::for_operation(self, Input::Macro(parameter)).validated(Ok(()))
    }

    fn recreate_context(&self, spent: &ExecutionContext) -> ExecutionContext {
        let Some(parameter) = spent.redo_input().as_macro() else {
            return self.create_context(spent.redo_input().clone());
        };
        let slots = parameter.with_slots(|slots| {
            slots
                .iter()
                .map(|slot| {
                    let nested = slot.as_ref()?;
                    Some(nested.owner()?.recreate_context(nested))
                })
                .collect()
        });
        self.create_context(Input::Macro(MacroExecutionParameter::from_slots(slots)))
    }

    #[tracing::instrument(skip(self, context), fields(operation = %self.id, context = %context.id()))]
    fn do_operation(&self, context: &mut ExecutionContext) -> Result<()> {
        let Some(parameter) = context.redo_input().as_macro().cloned() else {
            log_transition(context.fail(ExecutionError::invalid_input(
                &self.id,
                "expected nested execution contexts",
            )));
            return Ok(());
        };
        if let Err(error) = context.start() {
            tracing::warn!(%error, "composite context is not ready");
            return Ok(());
        }

        metrics::counter!("orchestration_composite_executions_total").increment(1);
        let started = Instant::now();

        let slots = parameter.take();
        if slots.iter().any(Option::is_none) {
            parameter.replace(slots);
            log_transition(context.fail(ExecutionError::MissingNestedContext(self.id.clone())));
            return Ok(());
        }
        let nested: Vec<ExecutionContext> = slots.into_iter().flatten().collect();
        let total = nested.len();

        let buckets = Arc::new(ResultBuckets::new(total));
        buckets.admit(&nested);
        let listener: Arc<dyn StateChangeListener> = buckets.clone();
        let results = match self
            .executor
            .execute_nested(nested, &listener, self.hooks.as_ref())
        {
            Ok(results) => results,
            Err(fatal) => {
                tracing::error!(error = %fatal, "nested execution aborted");
                log_transition(context.fail(fatal.clone()));
                return Err(fatal);
            }
        };

        buckets.record_missing(&results);
        if let Err(fatal) = buckets.wait(self.settings.latch_timeout) {
            tracing::error!(
                error = %fatal,
                outstanding = buckets.outstanding(),
                "nested contexts never settled, compensating"
            );
            buckets.reconcile(&results);
            metrics::counter!("orchestration_composite_failed_total").increment(1);
            log_transition(context.fail(fatal.clone()));
            let compensated = self.compensate(results)?;
            parameter.replace(compensated);
            return Err(fatal);
        }

        let mut failure = first_failure(&results, &buckets);
        let results = if failure.is_none() {
            let contexts: Vec<ExecutionContext> = results.into_iter().flatten().collect();
            match self.hooks.final_result(&contexts) {
                Ok(value) => {
                    parameter.replace(contexts.into_iter().map(Some).collect());
                    log_transition(context.complete(value, Some(Input::Macro(parameter))));
                    metrics::histogram!("orchestration_composite_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    tracing::info!(nested = total, "composite completed");
                    return Ok(());
                }
                Err(error) => {
                    failure = Some(error);
                    contexts.into_iter().map(Some).collect()
                }
            }
        } else {
            results
        };

        let error = failure.unwrap_or_else(|| {
            ExecutionError::rejected(&self.id, "nested execution did not succeed")
        });
        metrics::counter!("orchestration_composite_failed_total").increment(1);
        tracing::warn!(
            %error,
            succeeded = buckets.succeeded().len(),
            failed = buckets.failed().len(),
            missing = buckets.missing().len(),
            "composite failed, compensating"
        );
        log_transition(context.fail(error));

        let compensated = self.compensate(results)?;
        parameter.replace(compensated);
        metrics::histogram!("orchestration_composite_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(())
    }

    #[tracing::instrument(skip(self, context), fields(operation = %self.id, context = %context.id()))]
    fn undo_operation(&self, context: &mut ExecutionContext) -> Result<()> {
        if let Err(error) = context.begin_undo() {
            tracing::warn!(%error, "undo requested outside DONE");
            return Ok(());
        }
        let Some(bucket) = context.undo_input().and_then(Input::as_macro).cloned() else {
            log_transition(context.fail(ExecutionError::rollback_failed(
                &self.id,
                "no succeeded nested contexts recorded",
            )));
            return Ok(());
        };

        let slots = bucket.take();
        if slots.iter().any(Option::is_none) {
            bucket.replace(slots);
            log_transition(context.fail(ExecutionError::MissingNestedContext(self.id.clone())));
            return Ok(());
        }
        let done: Vec<ExecutionContext> = slots.into_iter().flatten().collect();

        let rolled_back = match self.executor.rollback_nested(done) {
            Ok(rolled_back) => rolled_back,
            Err(fatal) => {
                log_transition(context.fail(fatal.clone()));
                return Err(fatal);
            }
        };

        let first_error = rolled_back
            .iter()
            .flatten()
            .find(|nested| nested.state() == ContextState::Fail)
            .and_then(|nested| nested.error().cloned())
            .or_else(|| {
                rolled_back
                    .iter()
                    .enumerate()
                    .find_map(|(index, slot)| match slot {
                        None => Some(ExecutionError::MissingResult(index)),
                        Some(nested) if nested.state() != ContextState::Undone => {
                            Some(ExecutionError::rollback_failed(
                                nested.owner_id(),
                                format!("left in {}", nested.state()),
                            ))
                        }
                        Some(_) => None,
                    })
            });

        match first_error {
            None => {
                bucket.replace(rolled_back);
                log_transition(context.mark_undone());
                tracing::info!("composite undone");
            }
            Some(error) => {
                metrics::counter!("orchestration_rollback_failures_total").increment(1);
                tracing::warn!(%error, policy = ?self.settings.rollback_policy, "composite rollback failed");
                log_transition(context.fail(error));
                let settled = self.after_rollback_processing(rolled_back)?;
                bucket.replace(settled);
            }
        }
        Ok(())
    }
}

/// The error of the first nested slot, in submission order, that did not succeed.
fn first_failure(
    results: &[Option<ExecutionContext>],
    buckets: &ResultBuckets,
) -> Option<ExecutionError> {
    results
        .iter()
        .enumerate()
        .find_map(|(index, slot)| match slot {
            None => Some(ExecutionError::MissingResult(index)),
            Some(context) if buckets.is_succeeded(context.id()) => None,
            Some(context) => Some(context.error().cloned().unwrap_or_else(|| {
                ExecutionError::rejected(
                    context.owner_id(),
                    format!("nested context ended in {}", context.state()),
                )
            })),
        })
}
