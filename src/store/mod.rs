//! Durable record persistence.
//!
//! The orchestration core talks to storage only through [`RecordStore`]:
//! versioned JSON records addressed by `(kind, id)`. A `put` carrying an
//! expected version is rejected with `ConcurrentModification` when the stored
//! version has moved on. [`Records`] layers typed helpers, version tracking
//! and transient-error retries on top.

mod file;
mod memory;
mod records;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use records::{DecisionRecord, Records, PHASE_RECORD_ID};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Record families. Each gets its own namespace of ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Chunk,
    Dependency,
    Agent,
    /// Singleton oscillator state.
    Phase,
    Decision,
    CoherenceLog,
    Task,
}

impl RecordKind {
    pub const ALL: [RecordKind; 7] = [
        RecordKind::Chunk,
        RecordKind::Dependency,
        RecordKind::Agent,
        RecordKind::Phase,
        RecordKind::Decision,
        RecordKind::CoherenceLog,
        RecordKind::Task,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Chunk => "chunk",
            RecordKind::Dependency => "dependency",
            RecordKind::Agent => "agent",
            RecordKind::Phase => "phase",
            RecordKind::Decision => "decision",
            RecordKind::CoherenceLog => "coherence_log",
            RecordKind::Task => "task",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored value and the version it was written at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub kind: RecordKind,
    pub id: String,
    /// Starts at 1 and increases by one on every write.
    pub version: u64,
    pub value: serde_json::Value,
}

/// Selection applied by `list`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RecordFilter {
    #[default]
    All,
    /// Top-level field of the record value equals `value`.
    FieldEquals {
        field: String,
        value: serde_json::Value,
    },
}

impl RecordFilter {
    pub fn field_equals(field: &str, value: impl Into<serde_json::Value>) -> Self {
        RecordFilter::FieldEquals {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            RecordFilter::All => true,
            RecordFilter::FieldEquals { field, value: want } => value.get(field) == Some(want),
        }
    }
}

/// Versioned key/value persistence.
///
/// Implementations must make `put` atomic with respect to its version check.
pub trait RecordStore: Send + Sync {
    fn get(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>>;

    /// Write `value`, returning the new version. With `expected_version`
    /// set, the write only succeeds if the current version (0 when absent)
    /// matches.
    fn put(
        &self,
        kind: RecordKind,
        id: &str,
        value: serde_json::Value,
        expected_version: Option<u64>,
    ) -> Result<u64>;

    /// Returns whether a record was removed.
    fn delete(&self, kind: RecordKind, id: &str) -> Result<bool>;

    /// Matching records of `kind`, ordered by id.
    fn list(&self, kind: RecordKind, filter: &RecordFilter) -> Result<Vec<StoredRecord>>;
}

/// Version check shared by the store implementations.
pub(crate) fn check_version(
    kind: RecordKind,
    id: &str,
    current: u64,
    expected: Option<u64>,
) -> Result<()> {
    match expected {
        Some(expected) if expected != current => Err(crate::Error::ConcurrentModification {
            kind: kind.to_string(),
            id: id.to_string(),
            expected,
            actual: current,
        }),
        _ => Ok(()),
    }
}
