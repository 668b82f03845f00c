//! A stand-in executor for dry runs.
//!
//! Sleeps in proportion to each subtask's effort and fails the subtasks it
//! was told to fail. Useful for previewing how a decomposition schedules.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::{DeclaredEffort, DurationSource, Subtask, SubtaskId};
use crate::error::{Error, Result};
use crate::orchestration::executor::{SubtaskExecutor, SubtaskResult};

#[derive(Clone)]
pub struct SimulatedExecutor {
    /// Wall-clock milliseconds slept per estimated minute.
    ms_per_minute: u64,
    failures: HashSet<SubtaskId>,
    estimator: Arc<dyn DurationSource>,
}

impl SimulatedExecutor {
    pub fn new(ms_per_minute: u64) -> Self {
        Self {
            ms_per_minute,
            failures: HashSet::new(),
            estimator: Arc::new(DeclaredEffort::default()),
        }
    }

    /// Subtasks that report failure instead of success.
    pub fn with_failures<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SubtaskId>,
    {
        self.failures.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn DurationSource>) -> Self {
        self.estimator = estimator;
        self
    }

    fn delay(&self, subtask: &Subtask) -> Duration {
        Duration::from_millis(
            self.ms_per_minute
                .saturating_mul(u64::from(self.estimator.minutes(subtask))),
        )
    }
}

#[async_trait]
impl SubtaskExecutor for SimulatedExecutor {
    async fn execute(&self, subtask: Subtask, cancel: CancellationToken) -> Result<SubtaskResult> {
        let started = Instant::now();
        let delay = self.delay(&subtask);

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Execution(format!("{} was cancelled", subtask.title)));
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let result = if self.failures.contains(&subtask.id) {
            SubtaskResult::failure(format!("Simulated failure in {}", subtask.title))
        } else {
            SubtaskResult::ok(format!(
                "Simulated {} ({} min)",
                subtask.title,
                self.estimator.minutes(&subtask)
            ))
        };
        Ok(result.with_duration(started.elapsed()))
    }
}
