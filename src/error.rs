use thiserror::Error;

use crate::core::SubtaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle detected: {}", format_cycles(.cycles))]
    CycleDetected { cycles: Vec<Vec<SubtaskId>> },

    #[error("Unresolvable dependencies: {}", format_missing(.missing))]
    UnresolvableDependency { missing: Vec<(SubtaskId, SubtaskId)> },

    #[error("Subtask not found: {0}")]
    SubtaskNotFound(SubtaskId),

    #[error("Subtask already exists: {0}")]
    DuplicateSubtask(SubtaskId),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_cycles(cycles: &[Vec<SubtaskId>]) -> String {
    cycles
        .iter()
        .map(|cycle| {
            cycle
                .iter()
                .map(|id| id.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_missing(missing: &[(SubtaskId, SubtaskId)]) -> String {
    missing
        .iter()
        .map(|(subtask, dep)| format!("{} depends on unknown {}", subtask, dep))
        .collect::<Vec<_>>()
        .join(", ")
}
