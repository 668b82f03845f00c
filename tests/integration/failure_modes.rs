//! Failure policy tests.
//!
//! These tests verify how each failure mode shapes a run once a subtask
//! fails, errors or times out.

use std::sync::Arc;

use tokio::sync::mpsc;

use wavefront::core::{GraphBuilder, SubtaskId, SubtaskStatus};
use wavefront::orchestration::{ExecutionEvent, FailureMode, ParallelExecutor, Resolver};

use crate::fixtures::{chain, executor_config, ids, independent, scenario, ScriptedExecutor};

// ========== Skip dependents ==========

/// Test: Executor error under skip-dependents
/// Given the executor returns an error for B
/// Then B fails with the captured message, D is skipped naming B,
/// D is never executed, and C still completes
#[tokio::test]
async fn test_skip_dependents_on_executor_error() {
    let mut decomposition = scenario();
    let work = Arc::new(ScriptedExecutor::new(1).erroring(&["B"]));
    let executor = ParallelExecutor::new(executor_config(3, FailureMode::SkipDependents)).unwrap();

    let result = executor.execute(&mut decomposition, work.clone()).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.completed, ids(&["A", "C"]));
    assert_eq!(result.failed, ids(&["B"]));
    assert_eq!(result.skipped, ids(&["D"]));

    let b = result.result("B").unwrap();
    assert!(!b.success);
    assert!(b.error.as_deref().unwrap().contains("Write API exploded"));

    let d = result.result("D").unwrap();
    assert!(!d.success);
    assert_eq!(
        d.error.as_deref(),
        Some("Skipped due to failed dependency: Write API")
    );
    assert!(!work.was_called("D"));
}

/// Test: Skips propagate transitively
/// Given a chain whose first step fails
/// Then every later step is skipped and none of them run
#[tokio::test]
async fn test_skip_is_transitive() {
    let mut decomposition = chain(5);
    let work = Arc::new(ScriptedExecutor::new(0).failing(&["t0"]));
    let executor = ParallelExecutor::new(executor_config(2, FailureMode::SkipDependents)).unwrap();

    let result = executor.execute(&mut decomposition, work.clone()).await.unwrap();

    assert_eq!(result.failed, ids(&["t0"]));
    assert_eq!(result.skipped, ids(&["t1", "t2", "t3", "t4"]));
    assert_eq!(work.calls(), ids(&["t0"]));
    assert!(!result.stalled);
    for id in ["t1", "t2", "t3", "t4"] {
        assert_eq!(
            result.result(id).unwrap().error.as_deref(),
            Some("Skipped due to failed dependency: Step 0")
        );
    }
}

/// Test: Timeout counts as a failure
/// Given a 20ms timeout and a subtask that takes far longer
/// Then it fails with a timeout message and its dependents are skipped
#[tokio::test]
async fn test_timeout_is_failure() {
    let mut decomposition = scenario();
    let work = Arc::new(ScriptedExecutor::new(0).with_delay("B", 5_000));
    let mut config = executor_config(3, FailureMode::SkipDependents);
    config.subtask_timeout_ms = 20;
    let executor = ParallelExecutor::new(config).unwrap();

    let result = executor.execute(&mut decomposition, work).await.unwrap();

    assert_eq!(result.failed, ids(&["B"]));
    assert!(result
        .result("B")
        .unwrap()
        .error
        .as_deref()
        .unwrap()
        .contains("timed out"));
    assert_eq!(result.skipped, ids(&["D"]));
    assert!(result.duration_ms < 5_000);
}

// ========== Abort ==========

/// Test: Abort stops dispatching
/// Given abort mode with continue_on_failure off
/// When the first subtask fails
/// Then no further batch is dispatched and the rest is skipped
#[tokio::test]
async fn test_abort_stops_dispatching() {
    let mut decomposition = scenario();
    let work = Arc::new(ScriptedExecutor::new(0).failing(&["A"]));
    let executor = ParallelExecutor::new(executor_config(3, FailureMode::Abort)).unwrap();

    let result = executor.execute(&mut decomposition, work.clone()).await.unwrap();

    assert!(result.aborted);
    assert!(!result.success);
    assert_eq!(work.calls(), ids(&["A"]));
    assert_eq!(result.failed, ids(&["A"]));
    assert_eq!(result.skipped, ids(&["B", "C", "D"]));
}

/// Test: Abort lets the current batch finish
/// Given two subtasks in one batch and a third waiting
/// When the fast one fails
/// Then the slow one still completes but the third never runs
#[tokio::test]
async fn test_abort_records_in_flight_work() {
    let mut decomposition = independent(3);
    let work = Arc::new(
        ScriptedExecutor::new(0)
            .failing(&["i0"])
            .with_delay("i1", 30),
    );
    let executor = ParallelExecutor::new(executor_config(2, FailureMode::Abort)).unwrap();

    let result = executor.execute(&mut decomposition, work.clone()).await.unwrap();

    assert!(result.aborted);
    assert_eq!(result.failed, ids(&["i0"]));
    assert_eq!(result.completed, ids(&["i1"]));
    assert_eq!(result.skipped, ids(&["i2"]));
    assert!(!work.was_called("i2"));
}

/// Test: Two failures in one batch abort the run once
/// Given abort mode and a batch where two subtasks fail
/// Then exactly one Aborted event is sent, naming the first recorded failure
#[tokio::test]
async fn test_abort_event_sent_once() {
    let mut decomposition = independent(4);
    let work = Arc::new(
        ScriptedExecutor::new(0)
            .failing(&["i0", "i1"])
            .with_delay("i1", 20),
    );
    let (tx, mut rx) = mpsc::channel(64);
    let executor = ParallelExecutor::new(executor_config(3, FailureMode::Abort))
        .unwrap()
        .with_event_channel(tx);

    let result = executor.execute(&mut decomposition, work.clone()).await.unwrap();
    drop(executor);

    let mut aborts = Vec::new();
    while let Some(event) = rx.recv().await {
        if let ExecutionEvent::Aborted { failed } = event {
            aborts.push(failed);
        }
    }

    assert!(result.aborted);
    assert_eq!(aborts, ids(&["i0"]));
    assert_eq!(result.failed, ids(&["i0", "i1"]));
    assert_eq!(result.skipped, ids(&["i3"]));
    assert_eq!(
        result.result("i3").unwrap().error.as_deref(),
        Some("Execution aborted after failure of Independent 0")
    );
    assert!(!work.was_called("i3"));
}

/// Test: Resolver reports abort as a stop
#[test]
fn test_abort_outcome_cannot_continue() {
    let decomposition = scenario();
    let resolver = Resolver::new(FailureMode::Abort);
    let graph = resolver.build_graph(&decomposition);
    let mut state = resolver.create_initial_state(&decomposition);

    let outcome = resolver.handle_failure(&graph, &mut state, &SubtaskId::from("A"));
    assert!(!outcome.can_continue);
    assert!(outcome.skipped.is_empty());
}

/// Test: continue_on_failure overrides abort
/// Given abort mode with continue_on_failure on
/// When A fails
/// Then the run is not aborted; its dependents end up blocked by the stall
#[tokio::test]
async fn test_continue_on_failure_overrides_abort() {
    let mut decomposition = scenario();
    let work = Arc::new(ScriptedExecutor::new(0).failing(&["A"]));
    let mut config = executor_config(3, FailureMode::Abort);
    config.continue_on_failure = true;
    let executor = ParallelExecutor::new(config).unwrap();

    let result = executor.execute(&mut decomposition, work).await.unwrap();

    assert!(!result.aborted);
    assert!(result.stalled);
    assert_eq!(result.blocked, ids(&["B", "C", "D"]));
}

// ========== Continue ==========

/// Test: Continue keeps independent branches running
/// Given C fails under continue mode
/// Then B still completes, D can never start, and the run reports the stall
#[tokio::test]
async fn test_continue_reports_stall() {
    let mut decomposition = scenario();
    let work = Arc::new(ScriptedExecutor::new(0).failing(&["C"]));
    let executor = ParallelExecutor::new(executor_config(3, FailureMode::Continue)).unwrap();

    let result = executor.execute(&mut decomposition, work.clone()).await.unwrap();

    assert!(!result.success);
    assert!(result.stalled);
    assert_eq!(result.completed, ids(&["A", "B"]));
    assert_eq!(result.failed, ids(&["C"]));
    assert!(result.skipped.is_empty());
    assert_eq!(result.blocked, ids(&["D"]));
    assert!(!work.was_called("D"));
    assert!(matches!(
        decomposition.get("D").unwrap().status,
        SubtaskStatus::Blocked { .. }
    ));
    assert_eq!(
        result.completed.len() + result.failed.len() + result.skipped.len() + result.blocked.len(),
        decomposition.len(),
        "every subtask has a disposition"
    );
}

/// Test: Continue with a failing leaf does not stall
#[tokio::test]
async fn test_continue_failing_leaf() {
    let mut decomposition = independent(4);
    let work = Arc::new(ScriptedExecutor::new(0).failing(&["i2"]));
    let executor = ParallelExecutor::new(executor_config(2, FailureMode::Continue)).unwrap();

    let result = executor.execute(&mut decomposition, work).await.unwrap();

    assert!(!result.success);
    assert!(!result.stalled);
    assert_eq!(result.completed, ids(&["i0", "i1", "i3"]));
    assert_eq!(result.failed, ids(&["i2"]));
}

// ========== Preflight ==========

/// Test: Unknown dependency ids are rejected before anything runs
#[tokio::test]
async fn test_unknown_dependency_rejected() {
    let mut decomposition = chain(2);
    decomposition
        .get_mut("t1")
        .unwrap()
        .dependencies
        .push(SubtaskId::from("ghost"));
    let work = Arc::new(ScriptedExecutor::new(0));
    let executor = ParallelExecutor::with_builder(
        executor_config(2, FailureMode::SkipDependents),
        GraphBuilder::default(),
    )
    .unwrap();

    let result = executor.execute(&mut decomposition, work.clone()).await;

    assert!(matches!(
        result,
        Err(wavefront::Error::UnresolvableDependency { .. })
    ));
    assert!(work.calls().is_empty());
}
