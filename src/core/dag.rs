//! Dependency graph for subtask scheduling.
//!
//! [`GraphBuilder`] turns a slice of subtasks into a [`DependencyGraph`]:
//! edges, forward/reverse adjacency, detected cycles, topological levels and
//! heuristic critical-edge marking. The graph is a pure function of its
//! input; building twice from the same subtasks yields equal graphs.
//!
//! Edges point from a dependency to the subtask waiting on it, so walking
//! forward from a node reaches everything that (transitively) depends on it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

use crate::core::estimate::{DeclaredEffort, DurationSource};
use crate::core::subtask::{Subtask, SubtaskId};
use crate::wlog_warn;

/// A directed `from -> to` edge: `to` waits on `from`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyEdge {
    pub from: SubtaskId,
    pub to: SubtaskId,
    /// Both endpoints carry at least the graph's mean effort.
    ///
    /// This is a cheap heuristic for highlighting heavy chains and is
    /// unrelated to the exact critical path the resolver computes.
    pub is_critical: bool,
}

/// Edge label used by [`DependencyGraph::to_dot`].
impl std::fmt::Display for DependencyEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_critical {
            write!(f, "critical")
        } else {
            Ok(())
        }
    }
}

/// The subtask dependency graph.
///
/// Nodes are kept in input order and every listing derived from the graph
/// (levels, frontier, topological order) follows that order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<SubtaskId>,
    edges: Vec<DependencyEdge>,
    /// id -> ids that depend on it.
    adjacency: HashMap<SubtaskId, Vec<SubtaskId>>,
    /// id -> ids it depends on (known ids only).
    reverse_adjacency: HashMap<SubtaskId, Vec<SubtaskId>>,
    /// Effort minutes per node, as reported by the duration source.
    weights: HashMap<SubtaskId, u32>,
    levels: Vec<Vec<SubtaskId>>,
    cycles: Vec<Vec<SubtaskId>>,
    graph: DiGraph<SubtaskId, DependencyEdge>,
    index: HashMap<SubtaskId, NodeIndex>,
}

impl PartialEq for DependencyGraph {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes
            && self.edges == other.edges
            && self.adjacency == other.adjacency
            && self.reverse_adjacency == other.reverse_adjacency
            && self.weights == other.weights
            && self.levels == other.levels
            && self.cycles == other.cycles
    }
}

/// Builds [`DependencyGraph`]s from subtasks.
#[derive(Clone)]
pub struct GraphBuilder {
    estimator: Arc<dyn DurationSource>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new(Arc::new(DeclaredEffort::default()))
    }
}

impl GraphBuilder {
    /// Create a builder that weights nodes with the given duration source.
    pub fn new(estimator: Arc<dyn DurationSource>) -> Self {
        Self { estimator }
    }

    pub fn estimator(&self) -> &Arc<dyn DurationSource> {
        &self.estimator
    }

    /// Build the dependency graph for `subtasks`.
    ///
    /// Dependencies naming ids outside `subtasks` are left out of the graph;
    /// the resolver reports them as unresolvable. When the graph contains a
    /// cycle no levels are computed.
    pub fn build(&self, subtasks: &[Subtask]) -> DependencyGraph {
        let mut graph = DiGraph::new();
        let mut index = HashMap::with_capacity(subtasks.len());
        let mut nodes = Vec::with_capacity(subtasks.len());
        let mut weights = HashMap::with_capacity(subtasks.len());
        let mut adjacency: HashMap<SubtaskId, Vec<SubtaskId>> = HashMap::new();
        let mut reverse_adjacency: HashMap<SubtaskId, Vec<SubtaskId>> = HashMap::new();

        for subtask in subtasks {
            if index.contains_key(&subtask.id) {
                continue;
            }
            let node = graph.add_node(subtask.id.clone());
            index.insert(subtask.id.clone(), node);
            nodes.push(subtask.id.clone());
            weights.insert(subtask.id.clone(), self.estimator.minutes(subtask));
            adjacency.insert(subtask.id.clone(), Vec::new());
            reverse_adjacency.insert(subtask.id.clone(), Vec::new());
        }

        let mean = mean_weight(&weights);
        let mut edges = Vec::new();

        for subtask in subtasks {
            let mut seen = HashSet::new();
            for dep in &subtask.dependencies {
                if !index.contains_key(dep) || !seen.insert(dep) {
                    continue;
                }
                let is_critical = weight_at_least(&weights, dep, mean)
                    && weight_at_least(&weights, &subtask.id, mean);
                let edge = DependencyEdge {
                    from: dep.clone(),
                    to: subtask.id.clone(),
                    is_critical,
                };

                graph.add_edge(index[dep], index[&subtask.id], edge.clone());
                edges.push(edge);
                adjacency
                    .entry(dep.clone())
                    .or_default()
                    .push(subtask.id.clone());
                reverse_adjacency
                    .entry(subtask.id.clone())
                    .or_default()
                    .push(dep.clone());
            }
        }

        let cycles = if toposort(&graph, None).is_err() {
            find_cycles(&nodes, &adjacency)
        } else {
            Vec::new()
        };

        let levels = if cycles.is_empty() {
            compute_levels(&nodes, &reverse_adjacency)
        } else {
            Vec::new()
        };

        DependencyGraph {
            nodes,
            edges,
            adjacency,
            reverse_adjacency,
            weights,
            levels,
            cycles,
            graph,
            index,
        }
    }
}

fn mean_weight(weights: &HashMap<SubtaskId, u32>) -> f64 {
    if weights.is_empty() {
        return 0.0;
    }
    let total: u64 = weights.values().map(|&w| u64::from(w)).sum();
    total as f64 / weights.len() as f64
}

fn weight_at_least(weights: &HashMap<SubtaskId, u32>, id: &SubtaskId, mean: f64) -> bool {
    weights
        .get(id)
        .map(|&w| f64::from(w) >= mean)
        .unwrap_or(false)
}

/// Depth-first cycle search with an explicit stack.
///
/// When an edge reaches a node already on the current path, the path slice
/// from that node's occurrence to the current node, closed by the node
/// again, is reported as a cycle. Disjoint cycles are all reported.
fn find_cycles(
    nodes: &[SubtaskId],
    adjacency: &HashMap<SubtaskId, Vec<SubtaskId>>,
) -> Vec<Vec<SubtaskId>> {
    let mut cycles = Vec::new();
    let mut visited: HashSet<&SubtaskId> = HashSet::new();
    let mut on_path: HashSet<&SubtaskId> = HashSet::new();
    let mut path: Vec<&SubtaskId> = Vec::new();

    for start in nodes {
        if visited.contains(start) {
            continue;
        }

        let mut stack: Vec<(&SubtaskId, usize)> = vec![(start, 0)];
        visited.insert(start);
        on_path.insert(start);
        path.push(start);

        while let Some(&(node, cursor)) = stack.last() {
            let next = adjacency.get(node).and_then(|n| n.get(cursor));

            let Some(next) = next else {
                on_path.remove(node);
                path.pop();
                stack.pop();
                continue;
            };

            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            if on_path.contains(next) {
                if let Some(pos) = path.iter().position(|n| *n == next) {
                    let mut cycle: Vec<SubtaskId> =
                        path[pos..].iter().map(|n| (*n).clone()).collect();
                    cycle.push(next.clone());
                    cycles.push(cycle);
                }
            } else if visited.insert(next) {
                on_path.insert(next);
                path.push(next);
                stack.push((next, 0));
            }
        }
    }

    cycles
}

/// Peel the graph into levels.
///
/// Each round collects every unplaced node whose dependencies are all
/// placed. A round that places nothing ends the peeling; with cycles
/// filtered out beforehand that only happens on malformed input.
fn compute_levels(
    nodes: &[SubtaskId],
    reverse_adjacency: &HashMap<SubtaskId, Vec<SubtaskId>>,
) -> Vec<Vec<SubtaskId>> {
    let mut levels = Vec::new();
    let mut placed: HashSet<&SubtaskId> = HashSet::with_capacity(nodes.len());

    while placed.len() < nodes.len() {
        let level: Vec<&SubtaskId> = nodes
            .iter()
            .filter(|node| !placed.contains(node))
            .filter(|node| {
                reverse_adjacency
                    .get(*node)
                    .map(|deps| deps.iter().all(|dep| placed.contains(dep)))
                    .unwrap_or(true)
            })
            .collect();

        if level.is_empty() {
            wlog_warn!(
                "Level computation stalled with {} of {} subtasks unplaced",
                nodes.len() - placed.len(),
                nodes.len()
            );
            break;
        }

        placed.extend(level.iter().copied());
        levels.push(level.into_iter().cloned().collect());
    }

    levels
}

impl DependencyGraph {
    /// All subtask ids, in input order.
    pub fn nodes(&self) -> &[SubtaskId] {
        &self.nodes
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// id -> ids that depend on it.
    pub fn adjacency(&self) -> &HashMap<SubtaskId, Vec<SubtaskId>> {
        &self.adjacency
    }

    /// id -> ids it depends on.
    pub fn reverse_adjacency(&self) -> &HashMap<SubtaskId, Vec<SubtaskId>> {
        &self.reverse_adjacency
    }

    /// Parallel groups; empty when the graph has cycles.
    pub fn levels(&self) -> &[Vec<SubtaskId>] {
        &self.levels
    }

    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }

    /// Detected cycles, each closing back on its first id.
    pub fn cycles(&self) -> &[Vec<SubtaskId>] {
        &self.cycles
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Direct dependencies of `id`.
    pub fn dependencies_of(&self, id: &str) -> &[SubtaskId] {
        self.reverse_adjacency
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Direct dependents of `id`.
    pub fn dependents_of(&self, id: &str) -> &[SubtaskId] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Effort minutes recorded for `id`, or 0 for unknown ids.
    pub fn weight(&self, id: &str) -> u32 {
        self.weights.get(id).copied().unwrap_or(0)
    }

    /// Edges flagged by the mean-effort heuristic.
    pub fn critical_edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.edges.iter().filter(|e| e.is_critical)
    }

    /// Level index of `id`, if levels were computed and contain it.
    pub fn level_of(&self, id: &str) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|n| n.as_str() == id))
    }

    /// Size of the largest level.
    pub fn max_parallelism(&self) -> usize {
        self.levels.iter().map(Vec::len).max().unwrap_or(0)
    }

    // ========== Query helpers ==========

    /// Levels flattened into one execution order.
    pub fn topological_sort(&self) -> Vec<SubtaskId> {
        self.levels.iter().flatten().cloned().collect()
    }

    /// Every subtask `id` transitively depends on, nearest first.
    pub fn all_dependencies(&self, id: &str) -> Vec<SubtaskId> {
        self.closure(id, &self.reverse_adjacency)
    }

    /// Every subtask that transitively depends on `id`, nearest first.
    pub fn all_dependents(&self, id: &str) -> Vec<SubtaskId> {
        self.closure(id, &self.adjacency)
    }

    fn closure(&self, id: &str, links: &HashMap<SubtaskId, Vec<SubtaskId>>) -> Vec<SubtaskId> {
        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(id);
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        let mut found = Vec::new();

        while let Some(current) = queue.pop_front() {
            for next in links.get(current).into_iter().flatten() {
                if seen.insert(next.as_str()) {
                    found.push(next.clone());
                    queue.push_back(next.as_str());
                }
            }
        }

        found
    }

    /// Whether adding a `from -> to` edge (`to` waits on `from`) would close a cycle.
    ///
    /// True iff `to` already reaches `from`. Unknown ids never create cycles.
    pub fn would_create_cycle(&self, from: &str, to: &str) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&from), Some(&to)) => has_path_connecting(&self.graph, to, from, None),
            _ => false,
        }
    }

    /// The scheduling frontier.
    ///
    /// Every subtask outside `completed` and `in_progress` whose
    /// dependencies all lie in `completed`.
    pub fn parallel_executable(
        &self,
        completed: &HashSet<SubtaskId>,
        in_progress: &HashSet<SubtaskId>,
    ) -> Vec<SubtaskId> {
        self.nodes
            .iter()
            .filter(|id| !completed.contains(*id) && !in_progress.contains(*id))
            .filter(|id| {
                self.dependencies_of(id.as_str())
                    .iter()
                    .all(|dep| completed.contains(dep))
            })
            .cloned()
            .collect()
    }

    /// Graphviz rendering; critical edges are labelled.
    pub fn to_dot(&self) -> String {
        format!("{}", Dot::new(&self.graph))
    }
}
