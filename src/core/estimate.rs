//! Effort estimates used to weight the critical path.
//!
//! Estimating how long a subtask will take is somebody else's job; the
//! scheduler only consumes minutes through the [`DurationSource`] trait.

use serde::{Deserialize, Serialize};

use crate::core::subtask::Subtask;

/// Minutes assumed for a subtask that carries no estimate.
pub const DEFAULT_EFFORT_MINUTES: u32 = 30;

/// Estimated effort for one subtask.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffortEstimate {
    /// Expected duration in minutes.
    pub minutes: u32,
    /// Confidence in the estimate, from 0.0 to 1.0.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

impl EffortEstimate {
    pub fn new(minutes: u32, confidence: f64) -> Self {
        Self {
            minutes,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Supplies per-subtask duration estimates.
pub trait DurationSource: Send + Sync {
    fn estimate(&self, subtask: &Subtask) -> EffortEstimate;

    /// Shorthand for `estimate(subtask).minutes`.
    fn minutes(&self, subtask: &Subtask) -> u32 {
        self.estimate(subtask).minutes
    }
}

/// Uses the estimate attached to each subtask, falling back to a default.
#[derive(Debug, Clone, Copy)]
pub struct DeclaredEffort {
    default_minutes: u32,
}

impl DeclaredEffort {
    pub fn new(default_minutes: u32) -> Self {
        Self { default_minutes }
    }
}

impl Default for DeclaredEffort {
    fn default() -> Self {
        Self::new(DEFAULT_EFFORT_MINUTES)
    }
}

impl DurationSource for DeclaredEffort {
    fn estimate(&self, subtask: &Subtask) -> EffortEstimate {
        subtask
            .effort
            .unwrap_or_else(|| EffortEstimate::new(self.default_minutes, 0.0))
    }
}

/// Gives every subtask the same estimate.
#[derive(Debug, Clone, Copy)]
pub struct FixedEffort(pub EffortEstimate);

impl DurationSource for FixedEffort {
    fn estimate(&self, _subtask: &Subtask) -> EffortEstimate {
        self.0
    }
}
