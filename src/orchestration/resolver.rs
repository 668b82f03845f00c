//! Dependency resolution and run-state bookkeeping.
//!
//! The [`Resolver`] turns a decomposition into a [`ResolutionResult`]
//! (execution order, parallel groups, exact critical path) and applies
//! completions and failures to an [`ExecutionState`] according to its
//! [`FailureMode`].

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::{DependencyGraph, GraphBuilder, SubtaskId, TaskDecomposition};
use crate::error::{Error, Result};
use crate::orchestration::state::ExecutionState;
use crate::{wlog_debug, wlog_warn};

/// How a subtask failure affects the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Stop dispatching new work.
    Abort,
    /// Skip everything that transitively depends on the failed subtask.
    #[default]
    SkipDependents,
    /// Leave dependents alone and keep running independent branches.
    Continue,
}

impl std::fmt::Display for FailureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureMode::Abort => write!(f, "abort"),
            FailureMode::SkipDependents => write!(f, "skip_dependents"),
            FailureMode::Continue => write!(f, "continue"),
        }
    }
}

impl FromStr for FailureMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "abort" => Ok(FailureMode::Abort),
            "skip_dependents" | "skip" => Ok(FailureMode::SkipDependents),
            "continue" => Ok(FailureMode::Continue),
            other => Err(Error::Validation(format!("Unknown failure mode: {}", other))),
        }
    }
}

/// A subtask naming a dependency id that is not in the decomposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvableDependency {
    pub subtask: SubtaskId,
    pub missing: SubtaskId,
}

/// The longest-duration chain through the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CriticalPath {
    /// Ids from the first subtask on the chain to the last.
    pub path: Vec<SubtaskId>,
    /// Total minutes along `path`; the earliest possible finish time.
    pub duration: u64,
}

/// Output of [`Resolver::resolve`].
#[derive(Debug, Clone)]
pub struct ResolutionResult {
    /// The graph the result was computed from.
    pub graph: DependencyGraph,
    /// Topological order; empty when cyclic.
    pub order: Vec<SubtaskId>,
    /// The graph's levels.
    pub parallel_groups: Vec<Vec<SubtaskId>>,
    pub critical_path: CriticalPath,
    /// True when the input cannot be executed as given.
    pub has_unresolvable: bool,
    pub unresolvable: Vec<UnresolvableDependency>,
    pub cycles: Vec<Vec<SubtaskId>>,
}

impl ResolutionResult {
    pub fn is_executable(&self) -> bool {
        !self.has_unresolvable
    }

    /// Minutes until the last subtask could finish with unlimited parallelism.
    pub fn estimated_duration(&self) -> u64 {
        self.critical_path.duration
    }

    /// Convert a non-executable result into the matching preflight error.
    pub fn into_executable(self) -> Result<Self> {
        if !self.cycles.is_empty() {
            return Err(Error::CycleDetected {
                cycles: self.cycles,
            });
        }
        if !self.unresolvable.is_empty() {
            return Err(Error::UnresolvableDependency {
                missing: self
                    .unresolvable
                    .into_iter()
                    .map(|u| (u.subtask, u.missing))
                    .collect(),
            });
        }
        Ok(self)
    }
}

/// What [`Resolver::handle_failure`] decided.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Subtasks moved to `skipped` because of this failure.
    pub skipped: Vec<SubtaskId>,
    /// False when the failure mode asks the run to stop.
    pub can_continue: bool,
}

/// Summary numbers for a decomposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionStatistics {
    pub total_subtasks: usize,
    pub edge_count: usize,
    pub critical_edge_count: usize,
    pub level_count: usize,
    pub max_parallelism: usize,
    pub root_count: usize,
    pub leaf_count: usize,
    pub critical_path: Vec<SubtaskId>,
    /// Critical path duration in minutes.
    pub estimated_duration: u64,
    pub has_cycles: bool,
    pub unresolvable_count: usize,
}

/// Resolves decompositions and tracks execution state for one policy.
#[derive(Clone, Default)]
pub struct Resolver {
    builder: GraphBuilder,
    failure_mode: FailureMode,
}

impl Resolver {
    pub fn new(failure_mode: FailureMode) -> Self {
        Self::with_builder(GraphBuilder::default(), failure_mode)
    }

    /// Use a builder carrying a custom duration source.
    pub fn with_builder(builder: GraphBuilder, failure_mode: FailureMode) -> Self {
        Self {
            builder,
            failure_mode,
        }
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    pub fn builder(&self) -> &GraphBuilder {
        &self.builder
    }

    pub fn build_graph(&self, decomposition: &TaskDecomposition) -> DependencyGraph {
        self.builder.build(decomposition.subtasks())
    }

    /// Resolve a decomposition into an execution plan.
    ///
    /// A cyclic graph short-circuits: the result carries the cycles and
    /// `has_unresolvable`, with no order and no critical path.
    pub fn resolve(&self, decomposition: &TaskDecomposition) -> ResolutionResult {
        let graph = self.build_graph(decomposition);

        if graph.has_cycles() {
            wlog_warn!(
                "Resolution found {} cycle(s) in {} subtasks",
                graph.cycles().len(),
                graph.node_count()
            );
            return ResolutionResult {
                order: Vec::new(),
                parallel_groups: Vec::new(),
                critical_path: CriticalPath::default(),
                has_unresolvable: true,
                unresolvable: Vec::new(),
                cycles: graph.cycles().to_vec(),
                graph,
            };
        }

        let unresolvable: Vec<UnresolvableDependency> = decomposition
            .subtasks()
            .iter()
            .flat_map(|subtask| {
                subtask
                    .dependencies
                    .iter()
                    .filter(|dep| !graph.contains(dep.as_str()))
                    .map(|dep| UnresolvableDependency {
                        subtask: subtask.id.clone(),
                        missing: dep.clone(),
                    })
            })
            .collect();

        for entry in &unresolvable {
            wlog_warn!(
                "Subtask {} depends on unknown subtask {}",
                entry.subtask,
                entry.missing
            );
        }

        let critical_path = Self::critical_path(&graph);
        wlog_debug!(
            "Resolved {} subtasks into {} levels, critical path {:?} ({} min)",
            graph.node_count(),
            graph.levels().len(),
            critical_path.path,
            critical_path.duration
        );

        ResolutionResult {
            order: graph.topological_sort(),
            parallel_groups: graph.levels().to_vec(),
            critical_path,
            has_unresolvable: !unresolvable.is_empty(),
            unresolvable,
            cycles: Vec::new(),
            graph,
        }
    }

    /// Longest-path scheduling over the graph's levels.
    ///
    /// Each node finishes at its own duration plus the latest finish among
    /// its dependencies; the dependency that produced that latest finish is
    /// its predecessor. The path ends at the node with the latest finish and
    /// is read back through the predecessors. Ties go to whichever node
    /// comes first in level order.
    pub fn critical_path(graph: &DependencyGraph) -> CriticalPath {
        let mut finish: HashMap<&SubtaskId, u64> = HashMap::with_capacity(graph.node_count());
        let mut predecessor: HashMap<&SubtaskId, &SubtaskId> = HashMap::new();
        let mut end: Option<(&SubtaskId, u64)> = None;

        for node in graph.levels().iter().flatten() {
            let mut start = 0;
            for dep in graph.dependencies_of(node.as_str()) {
                if let Some(&dep_finish) = finish.get(dep) {
                    if dep_finish > start || !predecessor.contains_key(node) {
                        start = dep_finish;
                        predecessor.insert(node, dep);
                    }
                }
            }

            let node_finish = start + u64::from(graph.weight(node.as_str()));
            finish.insert(node, node_finish);

            if end.map(|(_, best)| node_finish > best).unwrap_or(true) {
                end = Some((node, node_finish));
            }
        }

        let Some((last, duration)) = end else {
            return CriticalPath::default();
        };

        let mut path = vec![last.clone()];
        let mut cursor = last;
        while let Some(&prev) = predecessor.get(cursor) {
            path.push(prev.clone());
            cursor = prev;
        }
        path.reverse();

        CriticalPath { path, duration }
    }

    pub fn statistics(&self, decomposition: &TaskDecomposition) -> ResolutionStatistics {
        let resolution = self.resolve(decomposition);
        let graph = &resolution.graph;

        ResolutionStatistics {
            total_subtasks: decomposition.len(),
            edge_count: graph.edge_count(),
            critical_edge_count: graph.critical_edges().count(),
            level_count: graph.levels().len(),
            max_parallelism: graph.max_parallelism(),
            root_count: decomposition.root_ids().len(),
            leaf_count: decomposition.leaf_ids().len(),
            critical_path: resolution.critical_path.path.clone(),
            estimated_duration: resolution.critical_path.duration,
            has_cycles: graph.has_cycles(),
            unresolvable_count: resolution.unresolvable.len(),
        }
    }

    // ========== Execution state ==========

    /// Seed state from the subtasks' recorded statuses.
    pub fn create_initial_state(&self, decomposition: &TaskDecomposition) -> ExecutionState {
        ExecutionState::from_decomposition(decomposition)
    }

    /// The frontier, minus anything already failed or skipped.
    pub fn next_executable(
        &self,
        graph: &DependencyGraph,
        state: &ExecutionState,
    ) -> Vec<SubtaskId> {
        graph
            .parallel_executable(&state.completed, &state.in_progress)
            .into_iter()
            .filter(|id| !state.failed.contains(id) && !state.skipped.contains(id))
            .collect()
    }

    /// Every subtask is terminal and nothing is running.
    pub fn is_complete(&self, state: &ExecutionState, total: usize) -> bool {
        state.finished_count() == total && state.in_progress.is_empty()
    }

    /// Record a success and return the dependents it unblocked.
    pub fn handle_completion(
        &self,
        graph: &DependencyGraph,
        state: &mut ExecutionState,
        id: &SubtaskId,
    ) -> Vec<SubtaskId> {
        state.mark_completed(id);

        graph
            .dependents_of(id.as_str())
            .iter()
            .filter(|dependent| state.is_pending(dependent.as_str()))
            .filter(|dependent| {
                graph
                    .dependencies_of(dependent.as_str())
                    .iter()
                    .all(|dep| state.completed.contains(dep))
            })
            .cloned()
            .collect()
    }

    /// Record a failure and apply the failure mode.
    pub fn handle_failure(
        &self,
        graph: &DependencyGraph,
        state: &mut ExecutionState,
        id: &SubtaskId,
    ) -> FailureOutcome {
        state.mark_failed(id);

        match self.failure_mode {
            FailureMode::Abort => FailureOutcome {
                skipped: Vec::new(),
                can_continue: false,
            },
            FailureMode::SkipDependents => {
                let skipped: Vec<SubtaskId> = graph
                    .all_dependents(id.as_str())
                    .into_iter()
                    .filter(|dependent| state.is_pending(dependent.as_str()))
                    .collect();
                for dependent in &skipped {
                    state.mark_skipped(dependent);
                }
                if !skipped.is_empty() {
                    wlog_debug!("Failure of {} skipped {:?}", id, skipped);
                }
                FailureOutcome {
                    skipped,
                    can_continue: true,
                }
            }
            FailureMode::Continue => FailureOutcome {
                skipped: Vec::new(),
                can_continue: true,
            },
        }
    }
}
