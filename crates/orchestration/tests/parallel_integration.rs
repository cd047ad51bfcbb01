//! Integration tests for parallel fan-out through the action relay.

mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use orchestration::{
    ActionContext, Command, ContextState, ExecutionError, Executed, FinalResult, Input, Leaf,
    ParallelExecutor, RollbackFailurePolicy, SharedOperation, ThreadLocalPropagator,
};
use serde_json::{Value, json};
use serial_test::serial;

fn recorded(count: usize, journal: &Arc<Journal>) -> Vec<SharedOperation> {
    (0..count)
        .map(|i| Recording::new(format!("p{i}"), journal).shared())
        .collect()
}

fn slot_owners(input: Option<&Input>) -> Vec<Option<String>> {
    input
        .and_then(Input::as_macro)
        .map(|parameter| {
            parameter.with_slots(|slots| {
                slots
                    .iter()
                    .map(|slot| slot.as_ref().map(|ctx| ctx.owner_id().to_string()))
                    .collect()
            })
        })
        .unwrap_or_default()
}

#[test]
fn test_parallel_composite_succeeds() {
    init_tracing();
    let journal = Journal::new();
    let op = parallel("fan-out", 3, recorded(3, &journal));

    let ctx = run(&op, json!({"term": "fall"}));

    assert_eq!(ctx.state(), ContextState::Done);
    assert_eq!(
        nested_states(ctx.undo_input()),
        vec![Some(ContextState::Done); 3]
    );
    assert_eq!(ctx.result().unwrap()["by"], json!("p2"));
}

#[test]
fn test_results_keep_submission_order() {
    let journal = Journal::new();
    let nested = (0..5)
        .map(|i| {
            Recording::new(format!("p{i}"), &journal)
                .with_prefetch_delay(Duration::from_millis(60 - 12 * i as u64))
                .shared()
        })
        .collect();
    let op = parallel("ordered", 5, nested);

    let ctx = run(&op, json!({}));

    assert_eq!(ctx.state(), ContextState::Done);
    let expected: Vec<_> = (0..5).map(|i| Some(format!("p{i}"))).collect();
    assert_eq!(slot_owners(ctx.undo_input()), expected);
}

#[test]
fn test_relayed_work_runs_on_calling_thread() {
    let journal = Journal::new();
    let op = parallel("affinity", 4, recorded(4, &journal));
    let owner = thread::current().id();

    let mut ctx = run(&op, json!({}));
    op.undo_operation(&mut ctx).unwrap();

    assert_eq!(ctx.state(), ContextState::Undone);
    let relayed: Vec<_> = journal
        .threads(Step::Do)
        .into_iter()
        .chain(journal.threads(Step::Undo))
        .collect();
    assert_eq!(relayed.len(), 8);
    assert!(relayed.iter().all(|id| *id == owner));
    assert!(journal.threads(Step::Prefetch).iter().all(|id| *id != owner));
}

#[test]
#[serial]
fn test_fan_out_overlaps_preparation() {
    let single = Duration::from_millis(100);
    let journal = Journal::new();
    let nested = (0..5)
        .map(|i| {
            Recording::new(format!("p{i}"), &journal)
                .with_prefetch_delay(single)
                .shared()
        })
        .collect();
    let op = parallel("overlap", 2, nested);

    let started = Instant::now();
    let ctx = run(&op, json!({}));
    let elapsed = started.elapsed();

    assert_eq!(ctx.state(), ContextState::Done);
    assert_eq!(
        nested_states(ctx.undo_input()),
        vec![Some(ContextState::Done); 5]
    );
    let expected: Vec<_> = (0..5).map(|i| Some(format!("p{i}"))).collect();
    assert_eq!(slot_owners(ctx.undo_input()), expected);
    assert!(elapsed < single * 5, "took {elapsed:?}");
}

#[test]
fn test_panicking_operation_leaves_an_empty_slot() {
    let journal = Journal::new();
    let nested = (0..5)
        .map(|i| {
            let recording = Recording::new(format!("p{i}"), &journal);
            if i == 2 {
                recording.panicking().shared()
            } else {
                recording.shared()
            }
        })
        .collect();
    let op = parallel("panics", 5, nested);

    let ctx = run(&op, json!({}));

    assert_eq!(ctx.state(), ContextState::Fail);
    assert_eq!(ctx.error(), Some(&ExecutionError::MissingResult(2)));
    assert_eq!(
        nested_states(Some(ctx.redo_input())),
        vec![
            Some(ContextState::Undone),
            Some(ContextState::Undone),
            None,
            Some(ContextState::Undone),
            Some(ContextState::Undone),
        ]
    );
    assert_eq!(journal.ran(Step::Do).len(), 5);
    let mut undone = journal.ran(Step::Undo);
    undone.sort();
    assert_eq!(undone, vec!["p0", "p1", "p3", "p4"]);
}

#[test]
fn test_mixed_outcome_compensates_every_success() {
    let journal = Journal::new();
    let nested = (0..4)
        .map(|i| {
            let recording = Recording::new(format!("p{i}"), &journal);
            if i == 1 {
                recording.failing().shared()
            } else {
                recording.shared()
            }
        })
        .collect();
    let op = parallel("mixed", 4, nested);

    let ctx = run(&op, json!({}));

    assert_eq!(ctx.state(), ContextState::Fail);
    assert!(matches!(ctx.error(), Some(ExecutionError::Rejected { .. })));
    let states = nested_states(Some(ctx.redo_input()));
    assert_eq!(
        states
            .iter()
            .filter(|state| **state == Some(ContextState::Done))
            .count(),
        0
    );
    assert_eq!(states[1], Some(ContextState::Fail));
    assert_eq!(
        states
            .iter()
            .filter(|state| **state == Some(ContextState::Undone))
            .count(),
        3
    );
}

#[test]
fn test_all_true_aggregates_boolean_results() {
    struct Flag(&'static str, bool);

    impl Command for Flag {
        fn name(&self) -> &str {
            self.0
        }

        fn execute(&self, _input: &Value) -> orchestration::Result<Executed> {
            Ok(Executed::new(json!(self.1), Value::Null))
        }

        fn rollback(&self, _undo: &Value) -> orchestration::Result<()> {
            Ok(())
        }
    }

    let mixed = composite(
        "deletes",
        parallel_executor(2),
        Arc::new(FinalResult::AllTrue),
        vec![Leaf::shared(Flag("a", true)), Leaf::shared(Flag("b", false))],
        RollbackFailurePolicy::Reapply,
    );
    let ctx = run(&mixed, json!({}));

    assert_eq!(ctx.state(), ContextState::Done);
    assert_eq!(ctx.result(), Some(&json!(false)));
}

struct ActionWitness {
    seen: Arc<Mutex<Vec<Option<ActionContext>>>>,
}

impl Command for ActionWitness {
    fn name(&self) -> &str {
        "action-witness"
    }

    fn prefetch(&self, _input: &mut Input) -> orchestration::Result<()> {
        self.seen.lock().unwrap().push(ThreadLocalPropagator::current());
        Ok(())
    }

    fn execute(&self, input: &Value) -> orchestration::Result<Executed> {
        Ok(Executed::new(input.clone(), Value::Null))
    }

    fn rollback(&self, _undo: &Value) -> orchestration::Result<()> {
        Ok(())
    }
}

#[test]
fn test_action_context_reaches_workers() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let nested = (0..3)
        .map(|_| {
            Leaf::shared(ActionWitness {
                seen: Arc::clone(&seen),
            })
        })
        .collect();
    let executor = ParallelExecutor::new(pool(3))
        .with_propagator(Arc::new(ThreadLocalPropagator))
        .with_relay_timeout(Some(Duration::from_secs(5)));
    let op = composite(
        "with-action",
        Arc::new(executor),
        Arc::new(FinalResult::LastResult),
        nested,
        RollbackFailurePolicy::Reapply,
    );

    let action = ActionContext::new("register-term");
    ThreadLocalPropagator::enter(action.clone());
    let ctx = run(&op, json!({}));
    ThreadLocalPropagator::exit();

    assert_eq!(ctx.state(), ContextState::Done);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|observed| observed.as_ref() == Some(&action)));
}

#[test]
#[serial]
fn test_relay_timeout_is_fatal() {
    let journal = Journal::new();
    let nested = vec![
        Recording::new("slow", &journal)
            .with_prefetch_delay(Duration::from_millis(300))
            .shared(),
    ];
    let executor =
        ParallelExecutor::new(pool(1)).with_relay_timeout(Some(Duration::from_millis(50)));
    let op = composite(
        "impatient",
        Arc::new(executor),
        Arc::new(FinalResult::LastResult),
        nested,
        RollbackFailurePolicy::Reapply,
    );

    let mut ctx = op.create_context(Input::Value(json!({})));
    let err = op.do_operation(&mut ctx).unwrap_err();

    assert!(err.is_fatal());
    assert!(matches!(err, ExecutionError::Timeout { .. }));
    assert_eq!(ctx.state(), ContextState::Fail);
    assert!(journal.ran(Step::Do).is_empty());
}

#[test]
#[serial]
fn test_queued_operations_do_not_share_one_reply_budget() {
    let journal = Journal::new();
    let nested = (0..3)
        .map(|i| {
            Recording::new(format!("q{i}"), &journal)
                .with_execute_delay(Duration::from_millis(60))
                .shared()
        })
        .collect();
    let executor =
        ParallelExecutor::new(pool(3)).with_relay_timeout(Some(Duration::from_millis(100)));
    let op = composite(
        "queued",
        Arc::new(executor),
        Arc::new(FinalResult::LastResult),
        nested,
        RollbackFailurePolicy::Reapply,
    );

    let ctx = run(&op, json!({}));

    assert_eq!(ctx.state(), ContextState::Done);
    assert_eq!(journal.ran(Step::Do).len(), 3);
    assert!(journal.ran(Step::Undo).is_empty());
}

#[test]
#[serial]
fn test_aborted_batch_reverts_applied_operations() {
    let journal = Journal::new();
    let nested = vec![
        Recording::new("fast-a", &journal).shared(),
        Recording::new("fast-b", &journal).shared(),
        Recording::new("stuck", &journal)
            .with_prefetch_delay(Duration::from_millis(300))
            .shared(),
    ];
    let executor =
        ParallelExecutor::new(pool(3)).with_relay_timeout(Some(Duration::from_millis(50)));
    let op = composite(
        "aborted",
        Arc::new(executor),
        Arc::new(FinalResult::LastResult),
        nested,
        RollbackFailurePolicy::Reapply,
    );

    let mut ctx = op.create_context(Input::Value(json!({})));
    let err = op.do_operation(&mut ctx).unwrap_err();

    assert!(matches!(err, ExecutionError::Timeout { .. }));
    assert_eq!(ctx.state(), ContextState::Fail);

    let mut applied = journal.ran(Step::Do);
    let mut reverted = journal.ran(Step::Undo);
    applied.sort();
    reverted.sort();
    assert_eq!(applied, vec!["fast-a", "fast-b"]);
    assert_eq!(reverted, applied);

    let owner = thread::current().id();
    assert!(journal.threads(Step::Undo).iter().all(|id| *id == owner));
}
