//! Chunk dependency graph.
//!
//! `ChunkGraph` keeps chunks as nodes and dependency edges (`source` must be
//! resolved before `target` may run) in a petgraph `StableDiGraph`, so node
//! indices survive removals. The graph is acyclic at all times: an edge that
//! would close a cycle is rejected before anything is inserted.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use petgraph::algo::{has_path_connecting, is_cyclic_directed};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::core::chunk::{Chunk, ChunkId, ChunkState, TaskId};
use crate::error::{Error, Result};

/// Type of dependency between chunks.
///
/// Both types block readiness; the distinction is descriptive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Target cannot start until source resolves.
    #[default]
    Blocks,
    /// Source output feeds target context.
    Informs,
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::Blocks => write!(f, "blocks"),
            DependencyType::Informs => write!(f, "informs"),
        }
    }
}

/// A directed dependency edge: `target` depends on `source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDependency {
    pub source: ChunkId,
    pub target: ChunkId,
    #[serde(rename = "type")]
    pub dep_type: DependencyType,
    /// Advisory weight in `[0, 1]`; never consulted for blocking.
    pub strength: f64,
}

impl ChunkDependency {
    /// A full-strength blocking edge.
    pub fn blocks(source: ChunkId, target: ChunkId) -> Self {
        Self {
            source,
            target,
            dep_type: DependencyType::Blocks,
            strength: 1.0,
        }
    }

    pub fn informs(source: ChunkId, target: ChunkId, strength: f64) -> Self {
        Self {
            source,
            target,
            dep_type: DependencyType::Informs,
            strength,
        }
    }

    /// Key under which the edge is persisted.
    pub fn record_id(&self) -> String {
        format!("{}->{}", self.source, self.target)
    }
}

/// Serializable, order-normalized copy of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub chunks: Vec<Chunk>,
    pub dependencies: Vec<ChunkDependency>,
}

/// The chunk dependency graph.
#[derive(Clone)]
pub struct ChunkGraph {
    graph: StableDiGraph<Chunk, ChunkDependency>,
    index: HashMap<ChunkId, NodeIndex>,
}

impl ChunkGraph {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Rebuild a graph from persisted chunks and edges.
    pub fn from_parts(chunks: Vec<Chunk>, dependencies: Vec<ChunkDependency>) -> Result<Self> {
        let mut graph = Self::new();
        for chunk in chunks {
            graph.add_chunk(chunk)?;
        }
        for dep in dependencies {
            graph.add_dependency(&dep.source, &dep.target, dep.dep_type, dep.strength)?;
        }
        Ok(graph)
    }

    /// Add a chunk. Chunk IDs are unique within the graph.
    pub fn add_chunk(&mut self, chunk: Chunk) -> Result<()> {
        if self.index.contains_key(&chunk.id) {
            return Err(Error::ChunkExists(chunk.id));
        }
        let id = chunk.id;
        let node = self.graph.add_node(chunk);
        self.index.insert(id, node);
        Ok(())
    }

    /// Add an edge meaning `target` depends on `source`.
    ///
    /// # Errors
    /// - `NotFound` if either chunk is missing
    /// - `Validation` for a duplicate edge or a strength outside `[0, 1]`
    /// - `CycleDetected` if the edge would close a cycle (self-edges included)
    ///
    /// The graph is untouched whenever an error is returned.
    pub fn add_dependency(
        &mut self,
        source: &ChunkId,
        target: &ChunkId,
        dep_type: DependencyType,
        strength: f64,
    ) -> Result<()> {
        if !strength.is_finite() || !(0.0..=1.0).contains(&strength) {
            return Err(Error::Validation(format!(
                "dependency strength must be within [0, 1], got {}",
                strength
            )));
        }
        let source_node = self.node(source)?;
        let target_node = self.node(target)?;

        if self.graph.find_edge(source_node, target_node).is_some() {
            return Err(Error::Validation(format!(
                "dependency {} -> {} already exists",
                source, target
            )));
        }

        if source_node == target_node
            || has_path_connecting(&self.graph, target_node, source_node, None)
        {
            return Err(Error::CycleDetected {
                source_id: *source,
                target_id: *target,
            });
        }

        self.graph.add_edge(
            source_node,
            target_node,
            ChunkDependency {
                source: *source,
                target: *target,
                dep_type,
                strength,
            },
        );
        Ok(())
    }

    /// Remove a chunk and every edge touching it.
    pub fn remove_chunk(&mut self, id: &ChunkId) -> Result<Chunk> {
        let node = self.node(id)?;
        self.index.remove(id);
        self.graph
            .remove_node(node)
            .ok_or_else(|| Error::not_found("chunk", id))
    }

    pub fn get_chunk(&self, id: &ChunkId) -> Option<&Chunk> {
        self.index
            .get(id)
            .and_then(|&node| self.graph.node_weight(node))
    }

    pub fn get_chunk_mut(&mut self, id: &ChunkId) -> Option<&mut Chunk> {
        match self.index.get(id) {
            Some(&node) => self.graph.node_weight_mut(node),
            None => None,
        }
    }

    /// Move a chunk through its lifecycle.
    pub fn set_state(&mut self, id: &ChunkId, state: ChunkState) -> Result<()> {
        self.get_chunk_mut(id)
            .ok_or_else(|| Error::not_found("chunk", id))?
            .transition(state)
    }

    pub fn contains_chunk(&self, id: &ChunkId) -> bool {
        self.index.contains_key(id)
    }

    pub fn chunk_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn has_dependency(&self, source: &ChunkId, target: &ChunkId) -> bool {
        match (self.index.get(source), self.index.get(target)) {
            (Some(&s), Some(&t)) => self.graph.find_edge(s, t).is_some(),
            _ => false,
        }
    }

    /// Edges whose target is `id`.
    pub fn incoming(&self, id: &ChunkId) -> Vec<&ChunkDependency> {
        match self.index.get(id) {
            Some(&node) => self
                .graph
                .edges_directed(node, Direction::Incoming)
                .map(|edge| edge.weight())
                .collect(),
            None => Vec::new(),
        }
    }

    /// IDs of chunks that depend directly on `id`.
    pub fn dependents(&self, id: &ChunkId) -> Vec<ChunkId> {
        match self.index.get(id) {
            Some(&node) => self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .filter_map(|n| self.graph.node_weight(n).map(|c| c.id))
                .collect(),
            None => Vec::new(),
        }
    }

    /// All chunks ordered by `created_at`, then `id`.
    pub fn all_chunks(&self) -> Vec<&Chunk> {
        let mut chunks: Vec<&Chunk> = self.graph.node_weights().collect();
        chunks.sort_by_key(|c| (c.created_at, c.id));
        chunks
    }

    pub fn dependencies(&self) -> Vec<&ChunkDependency> {
        self.graph.edge_weights().collect()
    }

    // ========== Scheduling Operations ==========

    /// Chunks still `created` whose every dependency source is resolved.
    ///
    /// Derived on every call from the current states and edges.
    pub fn ready_chunks(&self) -> Vec<&Chunk> {
        let mut ready: Vec<&Chunk> = self
            .graph
            .node_indices()
            .filter_map(|node| {
                let chunk = self.graph.node_weight(node)?;
                if chunk.state != ChunkState::Created {
                    return None;
                }
                let satisfied = self
                    .graph
                    .neighbors_directed(node, Direction::Incoming)
                    .all(|source| {
                        self.graph
                            .node_weight(source)
                            .map(|c| c.state.satisfies_dependents())
                            .unwrap_or(false)
                    });
                satisfied.then_some(chunk)
            })
            .collect();
        ready.sort_by_key(|c| (c.created_at, c.id));
        ready
    }

    /// Chunks in dependency order. Among chunks whose dependencies are all
    /// placed, the earliest `created_at` (then smallest `id`) goes first.
    pub fn topological_order(&self) -> Result<Vec<&Chunk>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                (
                    n,
                    self.graph.neighbors_directed(n, Direction::Incoming).count(),
                )
            })
            .collect();

        let mut heap: BinaryHeap<Reverse<(DateTime<Utc>, ChunkId, NodeIndex)>> = BinaryHeap::new();
        for (&node, &degree) in &in_degree {
            if degree == 0 {
                let chunk = &self.graph[node];
                heap.push(Reverse((chunk.created_at, chunk.id, node)));
            }
        }

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((_, _, node))) = heap.pop() {
            order.push(&self.graph[node]);
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        let chunk = &self.graph[next];
                        heap.push(Reverse((chunk.created_at, chunk.id, next)));
                    }
                }
            }
        }

        if order.len() != self.graph.node_count() {
            return Err(Error::Validation(
                "dependency graph contains a cycle".to_string(),
            ));
        }
        Ok(order)
    }

    /// The given chunks plus everything decomposed from them, transitively,
    /// through `parent_chunk_id`.
    pub fn hierarchy_closure(&self, roots: &[ChunkId]) -> Vec<ChunkId> {
        let mut seen: HashSet<ChunkId> = HashSet::new();
        let mut stack: Vec<ChunkId> = roots
            .iter()
            .filter(|id| self.contains_chunk(id))
            .copied()
            .collect();
        let mut out = Vec::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            out.push(id);
            stack.extend(
                self.graph
                    .node_weights()
                    .filter(|c| c.parent_chunk_id == Some(id))
                    .map(|c| c.id),
            );
        }
        out
    }

    /// Every chunk owned by `task_id`, directly or through a parent chunk.
    pub fn task_chunks(&self, task_id: &TaskId) -> Vec<ChunkId> {
        let roots: Vec<ChunkId> = self
            .graph
            .node_weights()
            .filter(|c| c.parent_task_id.as_ref() == Some(task_id))
            .map(|c| c.id)
            .collect();
        self.hierarchy_closure(&roots)
    }

    /// Structural problems worth surfacing during consolidation.
    ///
    /// `tracked` holds the chunks the orchestrator currently owns in flight or
    /// in a dispatch queue; an `assigned` or `processing` chunk outside it has
    /// been lost.
    pub fn integrity_issues(&self, tracked: &HashSet<ChunkId>) -> Vec<String> {
        let mut issues = Vec::new();
        if is_cyclic_directed(&self.graph) {
            issues.push("dependency graph contains a cycle".to_string());
        }
        for edge in self.graph.edge_references() {
            let dep = edge.weight();
            if self.graph.node_weight(edge.source()).map(|c| c.id) != Some(dep.source)
                || self.graph.node_weight(edge.target()).map(|c| c.id) != Some(dep.target)
            {
                issues.push(format!("edge {} does not match its endpoints", dep.record_id()));
            }
        }
        for chunk in self.graph.node_weights() {
            match chunk.state {
                ChunkState::Assigned | ChunkState::Processing if !tracked.contains(&chunk.id) => {
                    issues.push(format!(
                        "chunk {} is {} but not tracked by any dispatch queue",
                        chunk.id.short(),
                        chunk.state.name()
                    ));
                }
                ChunkState::Created => {
                    let blocked_by: Vec<String> = self
                        .incoming(&chunk.id)
                        .into_iter()
                        .filter_map(|d| self.get_chunk(&d.source))
                        .filter(|s| s.is_terminal() && !s.state.satisfies_dependents())
                        .map(|s| s.id.short())
                        .collect();
                    if !blocked_by.is_empty() {
                        issues.push(format!(
                            "chunk {} can never become ready: sources {} did not resolve",
                            chunk.id.short(),
                            blocked_by.join(", ")
                        ));
                    }
                }
                _ => {}
            }
        }
        issues
    }

    /// Order-normalized copy for persistence and comparison.
    pub fn snapshot(&self) -> GraphSnapshot {
        let mut chunks: Vec<Chunk> = self.graph.node_weights().cloned().collect();
        chunks.sort_by_key(|c| c.id);
        let mut dependencies: Vec<ChunkDependency> = self.graph.edge_weights().cloned().collect();
        dependencies.sort_by_key(|d| (d.source, d.target));
        GraphSnapshot {
            chunks,
            dependencies,
        }
    }

    fn node(&self, id: &ChunkId) -> Result<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::not_found("chunk", id))
    }
}

impl Default for ChunkGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChunkGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkGraph")
            .field("chunks", &self.chunk_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
