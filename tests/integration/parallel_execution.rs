//! Parallel execution correctness tests.
//!
//! These tests verify that the executor honours dependency order, the
//! concurrency cap and the batch barrier, and that it reports progress.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use wavefront::core::SubtaskStatus;
use wavefront::orchestration::{
    ExecutionEvent, ExecutionProgress, FailureMode, ParallelExecutor,
};

use crate::fixtures::{chain, executor_config, ids, independent, scenario, Phase, ScriptedExecutor};

/// Test: Scenario runs in dependency order
/// Given A -> {B, C} -> D
/// When executed with capacity 3
/// Then A finishes before B and C start, and both finish before D starts
#[tokio::test]
async fn test_scenario_respects_dependencies() {
    let mut decomposition = scenario();
    let work = Arc::new(ScriptedExecutor::new(5));
    let executor = ParallelExecutor::new(executor_config(3, FailureMode::SkipDependents)).unwrap();

    let result = executor.execute(&mut decomposition, work.clone()).await.unwrap();

    assert!(result.success);
    assert!(!result.stalled);
    assert_eq!(result.completed, ids(&["A", "B", "C", "D"]));
    assert!(work.position("A", Phase::Finish) < work.position("B", Phase::Start));
    assert!(work.position("A", Phase::Finish) < work.position("C", Phase::Start));
    assert!(work.position("B", Phase::Finish) < work.position("D", Phase::Start));
    assert!(work.position("C", Phase::Finish) < work.position("D", Phase::Start));
    assert_eq!(work.max_running(), 2, "B and C run together");
}

/// Test: Capacity of one runs sequentially
/// Given the scenario and max_concurrency = 1
/// Then B and C never overlap and order is still respected
#[tokio::test]
async fn test_single_slot_runs_sequentially() {
    let mut decomposition = scenario();
    let work = Arc::new(ScriptedExecutor::new(5));
    let executor = ParallelExecutor::new(executor_config(1, FailureMode::SkipDependents)).unwrap();

    let result = executor.execute(&mut decomposition, work.clone()).await.unwrap();

    assert!(result.success);
    assert_eq!(work.max_running(), 1);
    assert_eq!(work.calls(), ids(&["A", "B", "C", "D"]));
    assert!(work.position("B", Phase::Finish) < work.position("C", Phase::Start));
}

/// Test: In-progress count never exceeds the cap
/// Given 10 independent subtasks and max_concurrency = 3
/// Then no progress snapshot and no executor measurement exceeds 3
#[tokio::test]
async fn test_in_progress_never_exceeds_cap() {
    let mut decomposition = independent(10);
    let work = Arc::new(ScriptedExecutor::new(10));
    let executor = ParallelExecutor::new(executor_config(3, FailureMode::SkipDependents)).unwrap();

    let peak = Arc::new(Mutex::new(0usize));
    let seen = peak.clone();
    let _subscription = executor.subscribe(move |progress: &ExecutionProgress| {
        let mut peak = seen.lock().unwrap();
        *peak = (*peak).max(progress.in_progress);
    });

    let result = executor.execute(&mut decomposition, work.clone()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.completed.len(), 10);
    assert_eq!(*peak.lock().unwrap(), 3);
    assert_eq!(work.max_running(), 3);
}

/// Test: Freed slots wait for the whole batch
/// Given capacity 2, a fast and a slow subtask in the first batch, and a third subtask
/// Then the third subtask starts only after the slow one finishes
#[tokio::test]
async fn test_batch_barrier() {
    let mut decomposition = independent(3);
    let work = Arc::new(
        ScriptedExecutor::new(1)
            .with_delay("i1", 60)
            .with_delay("i2", 1),
    );
    let executor = ParallelExecutor::new(executor_config(2, FailureMode::SkipDependents)).unwrap();

    let result = executor.execute(&mut decomposition, work.clone()).await.unwrap();

    assert!(result.success);
    assert!(work.position("i0", Phase::Finish) < work.position("i1", Phase::Finish));
    assert!(work.position("i1", Phase::Finish) < work.position("i2", Phase::Start));
}

/// Test: Progress snapshots reach 100%
/// Then finished counts never decrease and the last snapshot is complete
#[tokio::test]
async fn test_progress_reaches_completion() {
    let mut decomposition = chain(4);
    let work = Arc::new(ScriptedExecutor::new(1));
    let executor = ParallelExecutor::new(executor_config(2, FailureMode::SkipDependents)).unwrap();

    let snapshots = Arc::new(Mutex::new(Vec::<ExecutionProgress>::new()));
    let sink = snapshots.clone();
    let subscription = executor.subscribe(move |progress: &ExecutionProgress| {
        sink.lock().unwrap().push(progress.clone());
    });

    executor.execute(&mut decomposition, work).await.unwrap();
    subscription.unsubscribe();

    let snapshots = snapshots.lock().unwrap();
    assert!(snapshots.len() >= 8, "a snapshot per dispatch and per result");
    assert!(snapshots
        .windows(2)
        .all(|pair| pair[0].finished() <= pair[1].finished()));
    let last = snapshots.last().unwrap();
    assert_eq!(last.percentage, 100.0);
    assert_eq!(last.completed, 4);
    assert!(last.current_tasks.is_empty());
    assert!(snapshots
        .iter()
        .any(|p| p.current_tasks == vec!["Step 2".to_string()]));
}

/// Test: Unsubscribed observers stop receiving snapshots
#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let executor = ParallelExecutor::new(executor_config(2, FailureMode::SkipDependents)).unwrap();
    let count = Arc::new(Mutex::new(0usize));
    let counter = count.clone();
    let subscription = executor.subscribe(move |_: &ExecutionProgress| {
        *counter.lock().unwrap() += 1;
    });
    subscription.unsubscribe();

    let mut decomposition = independent(2);
    executor
        .execute(&mut decomposition, Arc::new(ScriptedExecutor::new(0)))
        .await
        .unwrap();
    assert_eq!(*count.lock().unwrap(), 0);
}

/// Test: A panicking observer does not abort the run
#[tokio::test]
async fn test_panicking_observer_is_isolated() {
    let mut decomposition = scenario();
    let executor = ParallelExecutor::new(executor_config(3, FailureMode::SkipDependents)).unwrap();
    let _bad = executor.subscribe(|progress: &ExecutionProgress| {
        if progress.completed == 1 {
            panic!("observer failure");
        }
    });

    let result = executor
        .execute(&mut decomposition, Arc::new(ScriptedExecutor::new(0)))
        .await
        .unwrap();
    assert!(result.success);
}

/// Test: Statuses are written back to the decomposition
#[tokio::test]
async fn test_status_write_back() {
    let mut decomposition = scenario();
    let executor = ParallelExecutor::new(executor_config(3, FailureMode::SkipDependents)).unwrap();

    executor
        .execute(
            &mut decomposition,
            Arc::new(ScriptedExecutor::new(0).failing(&["C"])),
        )
        .await
        .unwrap();

    assert_eq!(decomposition.get("A").unwrap().status, SubtaskStatus::Completed);
    assert_eq!(decomposition.get("B").unwrap().status, SubtaskStatus::Completed);
    assert!(matches!(
        decomposition.get("C").unwrap().status,
        SubtaskStatus::Failed { .. }
    ));
    assert!(matches!(
        decomposition.get("D").unwrap().status,
        SubtaskStatus::Skipped { .. }
    ));
    assert!(decomposition.get("A").unwrap().completed_at.is_some());
}

/// Test: Lifecycle events bracket every subtask
#[tokio::test]
async fn test_event_stream() {
    let mut decomposition = chain(3);
    let (tx, mut rx) = mpsc::channel(32);
    let executor = ParallelExecutor::new(executor_config(2, FailureMode::SkipDependents))
        .unwrap()
        .with_event_channel(tx);

    executor
        .execute(&mut decomposition, Arc::new(ScriptedExecutor::new(0)))
        .await
        .unwrap();
    drop(executor);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let kinds: Vec<String> = events
        .iter()
        .map(|event| match event {
            ExecutionEvent::SubtaskStarted { id } => format!("start {}", id),
            ExecutionEvent::SubtaskCompleted { id, .. } => format!("done {}", id),
            other => format!("{:?}", other),
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "start t0",
            "done t0",
            "start t1",
            "done t1",
            "start t2",
            "done t2",
            "Finished { success: true }",
        ]
    );
}

/// Test: A full event channel never stalls the run
/// Given a channel with room for two events and nobody receiving
/// When six independent subtasks run
/// Then execute still returns and the channel holds the first two events
#[tokio::test]
async fn test_small_event_channel_does_not_block() {
    let mut decomposition = independent(6);
    let (tx, mut rx) = mpsc::channel(2);
    let executor = ParallelExecutor::new(executor_config(3, FailureMode::SkipDependents))
        .unwrap()
        .with_event_channel(tx);

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        executor.execute(&mut decomposition, Arc::new(ScriptedExecutor::new(0))),
    )
    .await
    .expect("execute must not wait on the event receiver")
    .unwrap();
    drop(executor);

    assert!(result.success);
    assert_eq!(result.completed.len(), 6);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], ExecutionEvent::SubtaskStarted { .. }));
}

/// Test: Resuming after an earlier failure skips its dependents
/// Given A was recorded as failed by a previous run
/// When the decomposition is executed again under skip-dependents
/// Then B, C and D are skipped naming A, nothing runs and nothing stalls
#[tokio::test]
async fn test_resume_skips_dependents_of_earlier_failure() {
    let mut decomposition = scenario();
    decomposition.get_mut("A").unwrap().fail("schema rejected");

    let work = Arc::new(ScriptedExecutor::new(0));
    let executor = ParallelExecutor::new(executor_config(2, FailureMode::SkipDependents)).unwrap();
    let result = executor.execute(&mut decomposition, work.clone()).await.unwrap();

    assert!(!result.stalled);
    assert!(!result.success);
    assert!(result.blocked.is_empty());
    assert_eq!(result.failed, ids(&["A"]));
    assert_eq!(result.skipped, ids(&["B", "C", "D"]));
    assert!(work.calls().is_empty());
    assert_eq!(
        result.result("B").unwrap().error.as_deref(),
        Some("Skipped due to failed dependency: Design schema")
    );
    assert!(matches!(
        decomposition.get("D").unwrap().status,
        SubtaskStatus::Skipped { .. }
    ));
}

/// Test: Resuming a partial run only executes what is left
#[tokio::test]
async fn test_resume_partial_run() {
    let mut decomposition = chain(4);
    decomposition.get_mut("t0").unwrap().complete();
    decomposition.get_mut("t1").unwrap().complete();
    decomposition.get_mut("t2").unwrap().start();

    let work = Arc::new(ScriptedExecutor::new(0));
    let executor = ParallelExecutor::new(executor_config(2, FailureMode::SkipDependents)).unwrap();
    let result = executor.execute(&mut decomposition, work.clone()).await.unwrap();

    assert!(result.success);
    assert_eq!(work.calls(), ids(&["t2", "t3"]));
    assert_eq!(result.completed, ids(&["t0", "t1", "t2", "t3"]));
}

/// Test: Cancelling mid-run skips what has not started
/// Given a chain and an observer that cancels once the first step completes
/// Then the remaining steps are skipped and the result is marked cancelled
#[tokio::test]
async fn test_cancel_mid_run() {
    let mut decomposition = chain(3);
    let executor = ParallelExecutor::new(executor_config(1, FailureMode::SkipDependents)).unwrap();
    let token = executor.cancellation_token();
    let _subscription = executor.subscribe(move |progress: &ExecutionProgress| {
        if progress.completed == 1 {
            token.cancel();
        }
    });

    let work = Arc::new(ScriptedExecutor::new(0));
    let result = executor.execute(&mut decomposition, work.clone()).await.unwrap();

    assert!(result.cancelled);
    assert!(!result.success);
    assert_eq!(result.completed, ids(&["t0"]));
    assert_eq!(result.skipped, ids(&["t1", "t2"]));
    assert_eq!(work.calls(), ids(&["t0"]));
    assert_eq!(
        result.result("t1").unwrap().error.as_deref(),
        Some("Execution cancelled")
    );
}

/// Test: execute_one runs a ready subtask without the main loop
#[tokio::test]
async fn test_execute_one() {
    let mut decomposition = scenario();
    decomposition.get_mut("A").unwrap().complete();
    let executor = ParallelExecutor::new(executor_config(1, FailureMode::SkipDependents)).unwrap();
    let work = Arc::new(ScriptedExecutor::new(0));

    let ready = executor
        .execute_one(&decomposition, "B", work.clone())
        .await
        .unwrap();
    assert!(ready.success);

    let waiting = executor
        .execute_one(&decomposition, "D", work.clone())
        .await
        .unwrap();
    assert!(!waiting.success);
    assert!(waiting.error.unwrap().starts_with("Dependencies not complete"));
    assert_eq!(work.calls(), ids(&["B"]));
}
