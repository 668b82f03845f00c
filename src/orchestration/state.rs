//! Per-run execution state.
//!
//! Five id sets track where every subtask stands. Apart from `blocked`,
//! which may overlap with the others when seeded from a previous run, an
//! id is in at most one set at a time. Only the executor's coordinating
//! loop mutates this state; workers report back through futures.

use std::collections::HashSet;

use serde::Serialize;

use crate::core::{SubtaskId, SubtaskStatus, TaskDecomposition};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionState {
    pub completed: HashSet<SubtaskId>,
    pub failed: HashSet<SubtaskId>,
    pub in_progress: HashSet<SubtaskId>,
    pub skipped: HashSet<SubtaskId>,
    pub blocked: HashSet<SubtaskId>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the sets from the subtasks' recorded statuses.
    pub fn from_decomposition(decomposition: &TaskDecomposition) -> Self {
        let mut state = Self::new();
        for subtask in decomposition.subtasks() {
            let id = subtask.id.clone();
            match subtask.status {
                SubtaskStatus::Pending => {}
                SubtaskStatus::InProgress => {
                    state.in_progress.insert(id);
                }
                SubtaskStatus::Completed => {
                    state.completed.insert(id);
                }
                SubtaskStatus::Failed { .. } => {
                    state.failed.insert(id);
                }
                SubtaskStatus::Skipped { .. } => {
                    state.skipped.insert(id);
                }
                SubtaskStatus::Blocked { .. } => {
                    state.blocked.insert(id);
                }
            }
        }
        state
    }

    /// Completed, failed or skipped.
    pub fn is_terminal(&self, id: &str) -> bool {
        self.completed.contains(id) || self.failed.contains(id) || self.skipped.contains(id)
    }

    /// Not terminal and not running.
    pub fn is_pending(&self, id: &str) -> bool {
        !self.is_terminal(id) && !self.in_progress.contains(id)
    }

    /// Number of terminal subtasks.
    pub fn finished_count(&self) -> usize {
        self.completed.len() + self.failed.len() + self.skipped.len()
    }

    pub fn mark_in_progress(&mut self, id: &SubtaskId) {
        self.blocked.remove(id);
        self.in_progress.insert(id.clone());
    }

    pub fn mark_completed(&mut self, id: &SubtaskId) {
        self.in_progress.remove(id);
        self.completed.insert(id.clone());
    }

    pub fn mark_failed(&mut self, id: &SubtaskId) {
        self.in_progress.remove(id);
        self.failed.insert(id.clone());
    }

    pub fn mark_skipped(&mut self, id: &SubtaskId) {
        self.in_progress.remove(id);
        self.blocked.remove(id);
        self.skipped.insert(id.clone());
    }

    pub fn mark_blocked(&mut self, id: &SubtaskId) {
        self.blocked.insert(id.clone());
    }

    /// Move every in-progress id back to pending and return them.
    ///
    /// A run that starts with in-progress subtasks is resuming after an
    /// interruption; nothing is actually running them any more.
    pub fn requeue_in_progress(&mut self) -> Vec<SubtaskId> {
        let mut requeued: Vec<SubtaskId> = self.in_progress.drain().collect();
        requeued.sort();
        requeued
    }
}
