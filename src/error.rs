use std::time::Duration;

use thiserror::Error;

use crate::agent::AgentId;
use crate::core::chunk::ChunkId;

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

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("Chunk already exists: {0}")]
    ChunkExists(ChunkId),

    #[error("Dependency from {source_id} to {target_id} would create a cycle")]
    CycleDetected {
        source_id: ChunkId,
        target_id: ChunkId,
    },

    #[error("No registered agent provides [{required}] for chunk {chunk_id}")]
    NoCapableAgent { chunk_id: ChunkId, required: String },

    #[error("All agents capable of handling chunk {chunk_id} are at capacity")]
    AgentsBusy { chunk_id: ChunkId },

    #[error("Phase {phase} exceeded its ceiling after {elapsed:?}")]
    PhaseTimeout { phase: String, elapsed: Duration },

    #[error("Cannot resolve an action for '{description}': no candidate actions")]
    ResolutionAmbiguous { description: String },

    #[error("Stale write to {kind}/{id}: expected version {expected}, found {actual}")]
    ConcurrentModification {
        kind: String,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Chunk {chunk_id} failed after {attempts} attempts: {error}")]
    ProcessingFailed {
        chunk_id: ChunkId,
        attempts: u32,
        error: String,
    },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Agent not registered: {0}")]
    AgentNotFound(AgentId),

    #[error("Record store error: {0}")]
    Store(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Chunk {0} was cancelled")]
    Cancelled(ChunkId),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    /// Whether a store operation that failed with this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Io(_) | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
