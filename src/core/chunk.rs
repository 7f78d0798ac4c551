//! Chunk data model for the dependency graph.
//!
//! Chunks are the atomic units of decomposed work. Each chunk tracks its
//! lifecycle state, its owning task and parent chunk, the worker it was
//! assigned to, and the processed result once a worker resolves it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::error::{Error, Result};

/// Open key/value metadata attached to chunks and strategic contexts.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Unique identifier for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub Uuid);

impl ChunkId {
    /// Create a new unique chunk identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ChunkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ChunkId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier of the task a chunk was decomposed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Semantic category of a chunk. Routing derives the required worker
/// capability from this (see `agent::required_capability`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    #[default]
    Task,
    Data,
    Context,
    Research,
    Note,
    Analysis,
}

impl std::fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChunkKind::Task => "task",
            ChunkKind::Data => "data",
            ChunkKind::Context => "context",
            ChunkKind::Research => "research",
            ChunkKind::Note => "note",
            ChunkKind::Analysis => "analysis",
        };
        write!(f, "{}", s)
    }
}

/// Chunk lifecycle state.
///
/// `created → ready → assigned → processing → resolved | failed → archived`,
/// with `cancelled` reachable from every non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ChunkState {
    /// Admitted into the graph, waiting on its dependency sources.
    #[default]
    Created,
    /// Dependencies resolved; waiting for a strategy and a worker.
    Ready,
    /// Routed to a worker, waiting for the phase gate to open.
    Assigned,
    /// A worker is processing the chunk.
    Processing,
    /// Processed successfully.
    Resolved,
    /// Retries exhausted or resolution impossible.
    Failed {
        /// Originating error.
        error: String,
    },
    /// Cancelled, directly or through its task.
    Cancelled {
        reason: String,
    },
    /// Retained for audit after reaching a terminal state.
    Archived {
        /// Whether the chunk had been resolved before archiving.
        resolved: bool,
    },
}

impl ChunkState {
    pub fn name(&self) -> &'static str {
        match self {
            ChunkState::Created => "created",
            ChunkState::Ready => "ready",
            ChunkState::Assigned => "assigned",
            ChunkState::Processing => "processing",
            ChunkState::Resolved => "resolved",
            ChunkState::Failed { .. } => "failed",
            ChunkState::Cancelled { .. } => "cancelled",
            ChunkState::Archived { .. } => "archived",
        }
    }

    /// Resolved, failed, cancelled or archived.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChunkState::Resolved
                | ChunkState::Failed { .. }
                | ChunkState::Cancelled { .. }
                | ChunkState::Archived { .. }
        )
    }

    /// Whether dependents of a chunk in this state may be released.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(
            self,
            ChunkState::Resolved | ChunkState::Archived { resolved: true }
        )
    }

    /// Legal lifecycle edges.
    pub fn can_transition(&self, target: &ChunkState) -> bool {
        use ChunkState::*;
        matches!(
            (self, target),
            (Created, Ready)
                | (Ready, Assigned)
                | (Ready, Failed { .. })
                | (Assigned, Processing)
                | (Assigned, Ready)
                | (Processing, Resolved)
                | (Processing, Failed { .. })
                | (Processing, Ready)
                | (Ready | Assigned | Processing, Created)
                | (Created | Ready | Assigned | Processing, Cancelled { .. })
                | (Resolved, Archived { resolved: true })
                | (Failed { .. } | Cancelled { .. }, Archived { resolved: false })
        )
    }
}

impl std::fmt::Display for ChunkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkState::Failed { error } => write!(f, "failed: {}", error),
            ChunkState::Cancelled { reason } => write!(f, "cancelled: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A single unit of decomposed work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub parent_task_id: Option<TaskId>,
    pub parent_chunk_id: Option<ChunkId>,
    content: String,
    pub processed_content: Option<String>,
    /// Position within the sibling set.
    pub index: usize,
    pub total_count: usize,
    pub kind: ChunkKind,
    pub state: ChunkState,
    #[serde(default)]
    pub metadata: Metadata,
    /// Worker currently (or last) assigned.
    pub agent_id: Option<AgentId>,
    /// Failed processing attempts so far.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chunk {
    /// Create a standalone chunk in the `created` state.
    pub fn new(kind: ChunkKind, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ChunkId::new(),
            parent_task_id: None,
            parent_chunk_id: None,
            content: content.into(),
            processed_content: None,
            index: 0,
            total_count: 1,
            kind,
            state: ChunkState::Created,
            metadata: Metadata::new(),
            agent_id: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Split a task into sibling chunks, one per part, in order.
    pub fn decompose(task_id: TaskId, kind: ChunkKind, parts: &[&str]) -> Vec<Chunk> {
        let total = parts.len();
        parts
            .iter()
            .enumerate()
            .map(|(index, part)| {
                let mut chunk = Chunk::new(kind, *part).with_task(task_id);
                chunk.index = index;
                chunk.total_count = total;
                chunk
            })
            .collect()
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.parent_task_id = Some(task_id);
        self
    }

    pub fn with_parent(mut self, parent: ChunkId) -> Self {
        self.parent_chunk_id = Some(parent);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// The original content. Immutable once the chunk exists.
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Move to `target`, rejecting edges outside the lifecycle.
    pub fn transition(&mut self, target: ChunkState) -> Result<()> {
        if !self.state.can_transition(&target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.name().to_string(),
                to: target.name().to_string(),
            });
        }
        self.state = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn assign(&mut self, agent_id: AgentId) -> Result<()> {
        self.transition(ChunkState::Assigned)?;
        self.agent_id = Some(agent_id);
        Ok(())
    }

    /// Record the worker's output and mark the chunk resolved.
    pub fn resolve(&mut self, processed: String) -> Result<()> {
        self.transition(ChunkState::Resolved)?;
        self.processed_content = Some(processed);
        Ok(())
    }

    pub fn fail(&mut self, error: &str) -> Result<()> {
        self.transition(ChunkState::Failed {
            error: error.to_string(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
