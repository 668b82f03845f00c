//! Dependency-aware subtask scheduling.
//!
//! A [`core::TaskDecomposition`] is turned into a [`core::DependencyGraph`],
//! analysed by the [`orchestration::Resolver`] and executed with bounded
//! parallelism by the [`orchestration::ParallelExecutor`].

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;

pub use error::{Error, Result};
