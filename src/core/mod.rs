//! Core domain models for wavefront scheduling.
//!
//! Subtasks and their decomposition, effort estimates, and the dependency
//! graph built from them.

pub mod dag;
pub mod estimate;
pub mod subtask;

pub use dag::{DependencyEdge, DependencyGraph, GraphBuilder};
pub use estimate::{DeclaredEffort, DurationSource, EffortEstimate, FixedEffort, DEFAULT_EFFORT_MINUTES};
pub use subtask::{Subtask, SubtaskId, SubtaskStatus, TaskDecomposition};
