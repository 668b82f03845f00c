//! Orchestration layer: resolving a decomposition into a plan and running it.
//!
//! The [`Resolver`] analyses the dependency graph and applies the failure
//! policy to per-run [`ExecutionState`]; the [`ParallelExecutor`] drives a
//! run against an injected [`SubtaskExecutor`].

mod executor;
mod progress;
mod resolver;
mod simulate;
mod state;

pub use executor::{
    ExecutionEvent, ExecutorConfig, ParallelExecutionResult, ParallelExecutor, SubtaskExecutor,
    SubtaskResult,
};
pub use progress::{ExecutionProgress, ProgressObservers, Subscription};
pub use resolver::{
    CriticalPath, FailureMode, FailureOutcome, ResolutionResult, ResolutionStatistics, Resolver,
    UnresolvableDependency,
};
pub use simulate::SimulatedExecutor;
pub use state::ExecutionState;
