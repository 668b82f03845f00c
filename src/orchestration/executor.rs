//! Bounded-concurrency execution of a decomposition.
//!
//! The [`ParallelExecutor`] is the single coordinator of a run. It polls
//! the resolver for the scheduling frontier, dispatches up to
//! `max_concurrency` subtasks as one batch, and waits for the whole batch
//! before looking at the frontier again. Workers never touch the
//! [`ExecutionState`]; each returns its [`SubtaskResult`] through a future
//! and the coordinator applies it.
//!
//! Each subtask runs in its own spawned task with a child
//! [`CancellationToken`]. A timeout cancels that token and aborts the task.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{DependencyGraph, GraphBuilder, Subtask, SubtaskId, SubtaskStatus, TaskDecomposition};
use crate::error::{Error, Result};
use crate::orchestration::progress::{ExecutionProgress, ProgressObservers, Subscription};
use crate::orchestration::resolver::{FailureMode, Resolver};
use crate::orchestration::state::ExecutionState;
use crate::{wlog, wlog_debug, wlog_trace, wlog_warn};

/// Runs the actual work of a subtask.
///
/// Returning `Err` is treated like a failed [`SubtaskResult`] carrying the
/// error's message. Implementations should stop early once `cancel` fires.
#[async_trait]
pub trait SubtaskExecutor: Send + Sync {
    async fn execute(&self, subtask: Subtask, cancel: CancellationToken) -> Result<SubtaskResult>;
}

#[async_trait]
impl<F, Fut> SubtaskExecutor for F
where
    F: Fn(Subtask, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<SubtaskResult>> + Send + 'static,
{
    async fn execute(&self, subtask: Subtask, cancel: CancellationToken) -> Result<SubtaskResult> {
        self(subtask, cancel).await
    }
}

/// Outcome of one subtask.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub files_affected: Vec<PathBuf>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub retries: u32,
}

impl SubtaskResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_files<I: IntoIterator<Item = PathBuf>>(mut self, files: I) -> Self {
        self.files_affected.extend(files);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "Subtask reported failure".to_string())
    }
}

/// Executor settings, also the `[executor]` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub failure_mode: FailureMode,
    /// Keep dispatching after a failure even when the failure mode says stop.
    #[serde(default = "default_true")]
    pub continue_on_failure: bool,
    /// Per-subtask time limit in milliseconds; 0 disables it.
    #[serde(default)]
    pub subtask_timeout_ms: u64,
}

fn default_max_concurrency() -> usize {
    3
}

fn default_true() -> bool {
    true
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            failure_mode: FailureMode::default(),
            continue_on_failure: true,
            subtask_timeout_ms: 0,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Validation(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.subtask_timeout_ms > 0).then(|| Duration::from_millis(self.subtask_timeout_ms))
    }
}

/// Lifecycle events sent on the optional event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    SubtaskStarted { id: SubtaskId },
    SubtaskCompleted { id: SubtaskId, duration_ms: u64 },
    SubtaskFailed { id: SubtaskId, error: String },
    SubtaskSkipped { id: SubtaskId, reason: String },
    /// No subtask could run; these were left blocked.
    Stalled { blocked: Vec<SubtaskId> },
    /// The failure of `failed` stopped the run.
    Aborted { failed: SubtaskId },
    Finished { success: bool },
}

/// Outcome of [`ParallelExecutor::execute`].
///
/// The id lists follow decomposition order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParallelExecutionResult {
    /// Identifies this run in the log.
    pub run_id: Uuid,
    /// No failures, no stall and no cancellation.
    pub success: bool,
    pub completed: Vec<SubtaskId>,
    pub failed: Vec<SubtaskId>,
    pub skipped: Vec<SubtaskId>,
    /// Subtasks that could never start because a dependency did not complete.
    pub blocked: Vec<SubtaskId>,
    /// The run ended because no remaining subtask could make progress.
    pub stalled: bool,
    pub aborted: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
    /// Every subtask that ran or was given a synthetic outcome.
    pub results: HashMap<SubtaskId, SubtaskResult>,
}

impl ParallelExecutionResult {
    pub fn result(&self, id: &str) -> Option<&SubtaskResult> {
        self.results.get(id)
    }
}

/// Executes decompositions with bounded parallelism.
pub struct ParallelExecutor {
    config: ExecutorConfig,
    resolver: Resolver,
    observers: ProgressObservers,
    events: Option<mpsc::Sender<ExecutionEvent>>,
    cancel: CancellationToken,
}

/// Mutable bookkeeping for one call to `execute`.
struct Run<'a> {
    decomposition: &'a mut TaskDecomposition,
    graph: DependencyGraph,
    state: ExecutionState,
    results: HashMap<SubtaskId, SubtaskResult>,
    started: Instant,
    aborted: bool,
}

impl Run<'_> {
    fn title(&self, id: &str) -> String {
        self.decomposition
            .get(id)
            .map(|s| s.title.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Pending ids in decomposition order.
    fn pending(&self) -> Vec<SubtaskId> {
        self.decomposition
            .subtasks()
            .iter()
            .filter(|s| self.state.is_pending(s.id.as_str()))
            .map(|s| s.id.clone())
            .collect()
    }

    fn ordered(&self, set: &HashSet<SubtaskId>) -> Vec<SubtaskId> {
        self.decomposition
            .subtasks()
            .iter()
            .filter(|s| set.contains(&s.id))
            .map(|s| s.id.clone())
            .collect()
    }

    fn set_status(&mut self, id: &str, status: SubtaskStatus) {
        if let Some(subtask) = self.decomposition.get_mut(id) {
            match status {
                SubtaskStatus::InProgress => subtask.start(),
                SubtaskStatus::Completed => subtask.complete(),
                SubtaskStatus::Failed { error } => subtask.fail(&error),
                SubtaskStatus::Skipped { reason } => subtask.skip(&reason),
                SubtaskStatus::Blocked { reason } => subtask.block(&reason),
                SubtaskStatus::Pending => subtask.status = SubtaskStatus::Pending,
            }
        }
    }
}

impl ParallelExecutor {
    /// # Errors
    /// Returns [`Error::Validation`] if the config is invalid.
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        Self::with_builder(config, GraphBuilder::default())
    }

    /// Use a builder carrying a custom duration source.
    pub fn with_builder(config: ExecutorConfig, builder: GraphBuilder) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            resolver: Resolver::with_builder(builder, config.failure_mode),
            config,
            observers: ProgressObservers::new(),
            events: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Send lifecycle events to `tx` in addition to progress snapshots.
    ///
    /// Events are sent with `try_send`: the run never waits on the
    /// receiver, so an event that finds the channel full is dropped. Size
    /// the channel for the run or drain it concurrently to see them all.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<ExecutionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&ExecutionProgress) + Send + Sync + 'static,
    {
        self.observers.subscribe(observer)
    }

    /// The token cancelled by [`ParallelExecutor::cancel`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the run: nothing new is dispatched and pending subtasks are
    /// skipped. Running subtasks see their token cancelled and their
    /// outcome is still recorded. Cancellation is permanent for this
    /// executor.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Execute every subtask of `decomposition`, writing status changes back.
    ///
    /// # Errors
    /// Cycles and unknown dependency ids are rejected before anything runs.
    /// Subtask failures, timeouts and stalls are reported in the result.
    pub async fn execute(
        &self,
        decomposition: &mut TaskDecomposition,
        executor: Arc<dyn SubtaskExecutor>,
    ) -> Result<ParallelExecutionResult> {
        let resolution = self.resolver.resolve(decomposition).into_executable()?;
        let total = decomposition.len();
        let run_id = Uuid::new_v4();

        let mut run = Run {
            state: self.resolver.create_initial_state(decomposition),
            graph: resolution.graph,
            decomposition,
            results: HashMap::new(),
            started: Instant::now(),
            aborted: false,
        };

        for id in run.state.requeue_in_progress() {
            wlog_warn!("Requeueing {} left in progress by an interrupted run", id);
            run.set_status(id.as_str(), SubtaskStatus::Pending);
        }
        self.propagate_seeded_failures(&mut run).await;

        wlog!(
            "Starting run {}: {} subtasks in {} levels, max_concurrency={}, failure_mode={}",
            run_id,
            total,
            resolution.parallel_groups.len(),
            self.config.max_concurrency,
            self.config.failure_mode
        );
        self.publish(&run);

        let mut stalled = false;
        let mut cancelled = false;

        while !self.resolver.is_complete(&run.state, total) && !run.aborted {
            if self.cancel.is_cancelled() {
                cancelled = true;
                self.skip_pending(&mut run, "Execution cancelled").await;
                wlog_warn!("Run cancelled");
                break;
            }

            let executable = self.resolver.next_executable(&run.graph, &run.state);
            wlog_trace!("Frontier: {:?}", executable);

            if executable.is_empty() && run.state.in_progress.is_empty() {
                stalled = true;
                self.block_pending(&mut run).await;
                break;
            }

            let slots = self
                .config
                .max_concurrency
                .saturating_sub(run.state.in_progress.len());
            let batch: Vec<SubtaskId> = executable.into_iter().take(slots).collect();
            wlog_debug!("Dispatching batch {:?}", batch);

            let mut running = FuturesUnordered::new();
            for id in batch {
                let Some(subtask) = run.decomposition.get(id.as_str()).cloned() else {
                    continue;
                };
                run.state.mark_in_progress(&id);
                run.set_status(id.as_str(), SubtaskStatus::InProgress);
                self.emit(ExecutionEvent::SubtaskStarted { id: id.clone() })
                    .await;
                self.publish(&run);
                running.push(self.dispatch(subtask, executor.clone()));
            }

            // Barrier: the frontier is only re-read once the whole batch is done.
            while let Some((id, result)) = running.next().await {
                self.record(&mut run, id, result).await;
            }
        }

        let success = run.state.failed.is_empty() && !stalled && !cancelled;
        let result = ParallelExecutionResult {
            run_id,
            success,
            completed: run.ordered(&run.state.completed),
            failed: run.ordered(&run.state.failed),
            skipped: run.ordered(&run.state.skipped),
            blocked: run.ordered(&run.state.blocked),
            stalled,
            aborted: run.aborted,
            cancelled,
            duration_ms: run.started.elapsed().as_millis() as u64,
            results: run.results,
        };

        wlog!(
            "Run {} finished in {}ms: {} completed, {} failed, {} skipped, {} blocked",
            run_id,
            result.duration_ms,
            result.completed.len(),
            result.failed.len(),
            result.skipped.len(),
            result.blocked.len()
        );
        self.emit(ExecutionEvent::Finished { success }).await;

        Ok(result)
    }

    /// Run a single subtask outside the main loop.
    ///
    /// The subtask's dependencies are checked against the statuses recorded
    /// in `decomposition`; if any is not completed a failed result is
    /// returned and the executor is not called.
    ///
    /// # Errors
    /// Returns [`Error::SubtaskNotFound`] for an unknown id.
    pub async fn execute_one(
        &self,
        decomposition: &TaskDecomposition,
        id: &str,
        executor: Arc<dyn SubtaskExecutor>,
    ) -> Result<SubtaskResult> {
        let subtask = decomposition
            .get(id)
            .ok_or_else(|| Error::SubtaskNotFound(SubtaskId::from(id)))?;
        let state = self.resolver.create_initial_state(decomposition);

        let waiting: Vec<&str> = subtask
            .dependencies
            .iter()
            .filter(|dep| !state.completed.contains(*dep))
            .map(|dep| dep.as_str())
            .collect();
        if !waiting.is_empty() {
            wlog_debug!("execute_one {}: waiting on {:?}", id, waiting);
            return Ok(SubtaskResult::failure(format!(
                "Dependencies not complete: {}",
                waiting.join(", ")
            )));
        }

        let (_, result) = self.dispatch(subtask.clone(), executor).await;
        Ok(result)
    }

    /// Run one subtask in its own task, applying the timeout.
    fn dispatch(
        &self,
        subtask: Subtask,
        executor: Arc<dyn SubtaskExecutor>,
    ) -> impl Future<Output = (SubtaskId, SubtaskResult)> + Send + 'static {
        let token = self.cancel.child_token();
        let limit = self.config.timeout();

        async move {
            let id = subtask.id.clone();
            let started = Instant::now();
            let worker_token = token.clone();
            let mut handle =
                tokio::spawn(async move { executor.execute(subtask, worker_token).await });

            let joined = match limit {
                Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        token.cancel();
                        handle.abort();
                        wlog_warn!("Subtask {} timed out after {:?}", id, limit);
                        let result = SubtaskResult::failure(Error::Timeout(limit).to_string())
                            .with_duration(started.elapsed());
                        return (id, result);
                    }
                },
                None => handle.await,
            };

            let mut result = match joined {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => SubtaskResult::failure(e.to_string()),
                Err(e) if e.is_panic() => {
                    SubtaskResult::failure(format!("Subtask panicked: {}", panic_message(e.into_panic())))
                }
                Err(e) => SubtaskResult::failure(Error::TaskJoin(e.to_string()).to_string()),
            };
            if result.duration_ms == 0 {
                result.duration_ms = started.elapsed().as_millis() as u64;
            }
            (id, result)
        }
    }

    /// Skip the pending dependents of failures recorded by a previous run.
    ///
    /// Only the skip propagation of the failure mode applies here; an
    /// earlier failure never aborts the resumed run.
    async fn propagate_seeded_failures(&self, run: &mut Run<'_>) {
        for id in run.ordered(&run.state.failed) {
            let outcome = self.resolver.handle_failure(&run.graph, &mut run.state, &id);
            if outcome.skipped.is_empty() {
                continue;
            }
            wlog_debug!("Earlier failure of {} skips {:?}", id, outcome.skipped);
            let reason = format!("Skipped due to failed dependency: {}", run.title(id.as_str()));
            for skipped in outcome.skipped {
                self.skip(run, skipped, &reason).await;
            }
        }
    }

    /// Apply a finished subtask's result. The first abort sets `run.aborted`.
    async fn record(&self, run: &mut Run<'_>, id: SubtaskId, result: SubtaskResult) {

        if result.success {
            let unblocked = self.resolver.handle_completion(&run.graph, &mut run.state, &id);
            run.set_status(id.as_str(), SubtaskStatus::Completed);
            wlog!("Subtask {} completed in {}ms", id, result.duration_ms);
            if !unblocked.is_empty() {
                wlog_debug!("{} unblocked {:?}", id, unblocked);
            }
            self.emit(ExecutionEvent::SubtaskCompleted {
                id: id.clone(),
                duration_ms: result.duration_ms,
            })
            .await;
        } else {
            let error = result.error_message();
            wlog_warn!("Subtask {} failed: {}", id, error);

            let outcome = self.resolver.handle_failure(&run.graph, &mut run.state, &id);
            run.set_status(id.as_str(), SubtaskStatus::Failed { error: error.clone() });
            self.emit(ExecutionEvent::SubtaskFailed {
                id: id.clone(),
                error,
            })
            .await;

            let reason = format!("Skipped due to failed dependency: {}", run.title(id.as_str()));
            for skipped in outcome.skipped {
                self.skip(run, skipped, &reason).await;
            }

            if !outcome.can_continue && !self.config.continue_on_failure && !run.aborted {
                run.aborted = true;
                wlog_warn!("Aborting run after failure of {}", id);
                let reason = format!("Execution aborted after failure of {}", run.title(id.as_str()));
                self.skip_pending(run, &reason).await;
                self.emit(ExecutionEvent::Aborted { failed: id.clone() })
                    .await;
            }
        }

        run.results.insert(id, result);
        self.publish(run);
    }

    /// Record a synthetic skip for a subtask already moved to `skipped`.
    async fn skip(&self, run: &mut Run<'_>, id: SubtaskId, reason: &str) {
        wlog_debug!("Skipping {}: {}", id, reason);
        run.set_status(
            id.as_str(),
            SubtaskStatus::Skipped {
                reason: reason.to_string(),
            },
        );
        run.results
            .insert(id.clone(), SubtaskResult::failure(reason.to_string()));
        self.emit(ExecutionEvent::SubtaskSkipped {
            id,
            reason: reason.to_string(),
        })
        .await;
    }

    /// Skip every pending subtask.
    async fn skip_pending(&self, run: &mut Run<'_>, reason: &str) {
        for id in run.pending() {
            run.state.mark_skipped(&id);
            self.skip(run, id, reason).await;
        }
        self.publish(run);
    }

    /// Mark every pending subtask blocked after a stall.
    async fn block_pending(&self, run: &mut Run<'_>) {
        let blocked = run.pending();

        for id in &blocked {
            let waiting_on = run
                .graph
                .dependencies_of(id.as_str())
                .iter()
                .find(|dep| !run.state.completed.contains(*dep))
                .map(|dep| run.title(dep.as_str()))
                .unwrap_or_else(|| "unknown".to_string());
            let reason = format!("Blocked: dependency {} did not complete", waiting_on);

            run.state.mark_blocked(id);
            run.set_status(
                id.as_str(),
                SubtaskStatus::Blocked {
                    reason: reason.clone(),
                },
            );
            run.results
                .insert(id.clone(), SubtaskResult::failure(reason));
        }

        wlog_warn!(
            "Run stalled with {} subtask(s) unable to start: {:?}",
            blocked.len(),
            blocked
        );
        self.emit(ExecutionEvent::Stalled { blocked }).await;
        self.publish(run);
    }

    fn publish(&self, run: &Run<'_>) {
        let progress =
            ExecutionProgress::snapshot(&run.state, &*run.decomposition, run.started.elapsed());
        self.observers.notify(&progress);
    }

    async fn emit(&self, event: ExecutionEvent) {
        if let Some(tx) = &self.events {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    wlog_debug!("Event channel full, dropping {:?}", event);
                }
                // A dropped receiver only means nobody is listening.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
