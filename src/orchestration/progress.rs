//! Progress snapshots and the observers that receive them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;

use crate::core::TaskDecomposition;
use crate::orchestration::state::ExecutionState;
use crate::wlog_error;

/// A point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub skipped: usize,
    pub blocked: usize,
    /// Titles of the subtasks currently running, in decomposition order.
    pub current_tasks: Vec<String>,
    /// Share of subtasks that are completed, failed or skipped, 0 to 100.
    pub percentage: f64,
    pub elapsed_ms: u64,
}

impl ExecutionProgress {
    pub fn snapshot(
        state: &ExecutionState,
        decomposition: &TaskDecomposition,
        elapsed: Duration,
    ) -> Self {
        let total = decomposition.len();
        let finished = state.finished_count();
        let percentage = if total == 0 {
            100.0
        } else {
            finished as f64 / total as f64 * 100.0
        };

        Self {
            total,
            completed: state.completed.len(),
            failed: state.failed.len(),
            in_progress: state.in_progress.len(),
            skipped: state.skipped.len(),
            blocked: state.blocked.len(),
            current_tasks: decomposition
                .subtasks()
                .iter()
                .filter(|s| state.in_progress.contains(&s.id))
                .map(|s| s.title.clone())
                .collect(),
            percentage,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

impl std::fmt::Display for ExecutionProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:>5.1}%] {}/{} done ({} ok, {} failed, {} skipped), {} running",
            self.percentage,
            self.finished(),
            self.total,
            self.completed,
            self.failed,
            self.skipped,
            self.in_progress
        )?;
        if !self.current_tasks.is_empty() {
            write!(f, ": {}", self.current_tasks.join(", "))?;
        }
        Ok(())
    }
}

type Observer = Arc<dyn Fn(&ExecutionProgress) + Send + Sync>;

#[derive(Default)]
struct ObserverList {
    next_id: u64,
    entries: Vec<(u64, Observer)>,
}

fn lock(list: &Mutex<ObserverList>) -> MutexGuard<'_, ObserverList> {
    list.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registered progress observers.
///
/// Observers are called in registration order. A panicking observer is
/// logged and skipped; it never interrupts the run or the other observers.
#[derive(Clone, Default)]
pub struct ProgressObservers {
    list: Arc<Mutex<ObserverList>>,
}

impl ProgressObservers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Keep the returned handle to unregister it.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&ExecutionProgress) + Send + Sync + 'static,
    {
        let mut list = lock(&self.list);
        let id = list.next_id;
        list.next_id += 1;
        list.entries.push((id, Arc::new(observer)));
        Subscription {
            id,
            list: Arc::downgrade(&self.list),
        }
    }

    /// Deliver a snapshot to every observer.
    pub fn notify(&self, progress: &ExecutionProgress) {
        // Call outside the lock so observers may subscribe or unsubscribe.
        let observers: Vec<(u64, Observer)> = lock(&self.list).entries.clone();

        for (id, observer) in observers {
            if catch_unwind(AssertUnwindSafe(|| (*observer)(progress))).is_err() {
                wlog_error!("Progress observer {} panicked; continuing", id);
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.list).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by [`ProgressObservers::subscribe`].
///
/// Dropping the handle leaves the observer registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    list: Weak<Mutex<ObserverList>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the observer. A no-op once its executor is gone.
    pub fn unsubscribe(self) {
        if let Some(list) = self.list.upgrade() {
            lock(&list).entries.retain(|(id, _)| *id != self.id);
        }
    }
}
