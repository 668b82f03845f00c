//! Subtask data model for the execution DAG.
//!
//! Subtasks are the atomic units of work produced by decomposing a task.
//! Each subtask names the subtasks it waits on; the inverse `dependents`
//! list is derived when the subtasks are gathered into a
//! [`TaskDecomposition`].

use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::estimate::EffortEstimate;
use crate::error::{Error, Result};

/// Unique identifier for a subtask within a decomposition.
///
/// Identifiers are caller-chosen strings (`"schema"`, `"api-routes"`, ...)
/// and serve as stable keys for every mapping in the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubtaskId(pub String);

impl SubtaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubtaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubtaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for SubtaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Subtask status in its lifecycle.
///
/// A subtask starts `Pending`, becomes `InProgress` when dispatched and
/// terminates as `Completed` or `Failed`. Dependents of a failed subtask
/// may move straight from `Pending` to `Skipped` without ever running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SubtaskStatus {
    /// Not yet dispatched.
    #[default]
    Pending,
    /// Currently being executed.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Never ran because the run decided it should not.
    Skipped {
        /// Why the subtask was skipped.
        reason: String,
    },
    /// Cannot run because a dependency will never complete.
    Blocked {
        /// Why the subtask is blocked.
        reason: String,
    },
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubtaskStatus::Pending => write!(f, "pending"),
            SubtaskStatus::InProgress => write!(f, "in_progress"),
            SubtaskStatus::Completed => write!(f, "completed"),
            SubtaskStatus::Failed { error } => write!(f, "failed: {}", error),
            SubtaskStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
            SubtaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
        }
    }
}

/// A single subtask in the decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Unique identifier for this subtask.
    pub id: SubtaskId,
    /// Human-readable title.
    pub title: String,
    /// Longer description of the work. Never interpreted by the scheduler.
    #[serde(default)]
    pub description: String,
    /// Subtasks that must complete before this one can start.
    #[serde(default)]
    pub dependencies: Vec<SubtaskId>,
    /// Subtasks that wait on this one. Derived, never read from input.
    #[serde(default, skip_deserializing, skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<SubtaskId>,
    /// Externally supplied effort estimate.
    #[serde(default)]
    pub effort: Option<EffortEstimate>,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: SubtaskStatus,
    /// When the subtask was last dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the subtask reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Subtask {
    /// Create a pending subtask with no dependencies and no estimate.
    pub fn new(id: impl Into<SubtaskId>, title: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            description: String::new(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            effort: None,
            status: SubtaskStatus::Pending,
            started_at: None,
            completed_at: None,
        }
    }

    /// Add dependencies, ignoring ids already present.
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SubtaskId>,
    {
        for id in ids {
            let id = id.into();
            if !self.dependencies.contains(&id) {
                self.dependencies.push(id);
            }
        }
        self
    }

    /// Attach an effort estimate.
    pub fn with_effort(mut self, minutes: u32, confidence: f64) -> Self {
        self.effort = Some(EffortEstimate::new(minutes, confidence));
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_status(mut self, status: SubtaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Transition to `InProgress` and record the start time.
    pub fn start(&mut self) {
        self.status = SubtaskStatus::InProgress;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
    }

    pub fn complete(&mut self) {
        self.status = SubtaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = SubtaskStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self, reason: &str) {
        self.status = SubtaskStatus::Skipped {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    pub fn block(&mut self, reason: &str) {
        self.status = SubtaskStatus::Blocked {
            reason: reason.to_string(),
        };
    }

    /// Completed, failed or skipped.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            SubtaskStatus::Completed | SubtaskStatus::Failed { .. } | SubtaskStatus::Skipped { .. }
        )
    }

    pub fn can_start(&self) -> bool {
        matches!(
            self.status,
            SubtaskStatus::Pending | SubtaskStatus::Blocked { .. }
        )
    }
}

/// A task broken into subtasks.
///
/// The decomposition owns its subtasks in insertion order; that order is
/// what every derived listing (levels, roots, leaves) is stable against.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(try_from = "DecompositionFile")]
pub struct TaskDecomposition {
    /// What the subtasks together accomplish.
    pub description: String,
    subtasks: Vec<Subtask>,
}

/// Serialized shape of a decomposition, validated on the way in.
#[derive(Deserialize)]
struct DecompositionFile {
    #[serde(default)]
    description: String,
    #[serde(default)]
    subtasks: Vec<Subtask>,
}

impl TryFrom<DecompositionFile> for TaskDecomposition {
    type Error = Error;

    fn try_from(file: DecompositionFile) -> Result<Self> {
        Self::new(&file.description, file.subtasks)
    }
}

impl TaskDecomposition {
    /// Gather subtasks into a decomposition, deriving `dependents`.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateSubtask`] if two subtasks share an id.
    pub fn new(description: &str, subtasks: Vec<Subtask>) -> Result<Self> {
        let mut seen = HashSet::new();
        for subtask in &subtasks {
            if !seen.insert(subtask.id.clone()) {
                return Err(Error::DuplicateSubtask(subtask.id.clone()));
            }
        }

        let mut decomposition = Self {
            description: description.to_string(),
            subtasks,
        };
        decomposition.link_dependents();
        Ok(decomposition)
    }

    pub fn subtasks(&self) -> &[Subtask] {
        &self.subtasks
    }

    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id.as_str() == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| s.id.as_str() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Subtasks with no dependencies.
    pub fn root_ids(&self) -> Vec<SubtaskId> {
        self.subtasks
            .iter()
            .filter(|s| s.dependencies.is_empty())
            .map(|s| s.id.clone())
            .collect()
    }

    /// Subtasks nothing depends on.
    pub fn leaf_ids(&self) -> Vec<SubtaskId> {
        self.subtasks
            .iter()
            .filter(|s| s.dependents.is_empty())
            .map(|s| s.id.clone())
            .collect()
    }

    /// Append a subtask.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateSubtask`] if the id is already present.
    pub fn add_subtask(&mut self, subtask: Subtask) -> Result<()> {
        if self.contains(subtask.id.as_str()) {
            return Err(Error::DuplicateSubtask(subtask.id));
        }
        self.subtasks.push(subtask);
        self.link_dependents();
        Ok(())
    }

    /// Remove a subtask and every reference other subtasks hold to it.
    ///
    /// # Errors
    /// Returns [`Error::SubtaskNotFound`] if the id is unknown.
    pub fn remove_subtask(&mut self, id: &str) -> Result<Subtask> {
        let position = self
            .subtasks
            .iter()
            .position(|s| s.id.as_str() == id)
            .ok_or_else(|| Error::SubtaskNotFound(SubtaskId::from(id)))?;

        let removed = self.subtasks.remove(position);
        for subtask in &mut self.subtasks {
            subtask.dependencies.retain(|dep| dep.as_str() != id);
        }
        self.link_dependents();
        Ok(removed)
    }

    /// Recompute every subtask's `dependents` from the dependency lists.
    ///
    /// Dependencies naming unknown ids are left in place; they are
    /// reported as unresolvable by the resolver.
    pub fn link_dependents(&mut self) {
        let mut dependents: HashMap<SubtaskId, Vec<SubtaskId>> = HashMap::new();
        for subtask in &self.subtasks {
            for dep in &subtask.dependencies {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(subtask.id.clone());
            }
        }
        for subtask in &mut self.subtasks {
            subtask.dependents = dependents.remove(&subtask.id).unwrap_or_default();
        }
    }

    /// Load a decomposition from a `.toml` file, or JSON for any other extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        if is_toml(path) {
            Ok(toml::from_str(&content)?)
        } else {
            Ok(serde_json::from_str(&content)?)
        }
    }

    /// Write the decomposition, statuses included, in the format `load` expects.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = if is_toml(path) {
            toml::to_string_pretty(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        fs::write(path, content)?;
        Ok(())
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("toml")
}
