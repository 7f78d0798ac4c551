//! Workers, their identities and the capabilities they declare.

use std::collections::BTreeSet;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::core::chunk::{Chunk, ChunkKind};
use crate::error::{Error, Result};
use crate::orchestration::resolver::TacticalAction;

/// Metadata key a chunk may use to demand capabilities beyond its kind.
pub const REQUIRED_CAPABILITY_KEY: &str = "requiredCapability";

/// Identifier chosen by whoever registers the worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of worker specializations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Planning,
    Transform,
    Synthesis,
    Research,
    Note,
    Analysis,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Planning => "planning",
            Capability::Transform => "transform",
            Capability::Synthesis => "synthesis",
            Capability::Research => "research",
            Capability::Note => "note",
            Capability::Analysis => "analysis",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planning" => Ok(Capability::Planning),
            "transform" => Ok(Capability::Transform),
            "synthesis" => Ok(Capability::Synthesis),
            "research" => Ok(Capability::Research),
            "note" => Ok(Capability::Note),
            "analysis" => Ok(Capability::Analysis),
            other => Err(Error::Validation(format!("unknown capability '{}'", other))),
        }
    }
}

/// The capability every chunk of a given kind needs.
pub fn required_capability(kind: ChunkKind) -> Capability {
    match kind {
        ChunkKind::Task => Capability::Planning,
        ChunkKind::Data => Capability::Transform,
        ChunkKind::Context => Capability::Synthesis,
        ChunkKind::Research => Capability::Research,
        ChunkKind::Note => Capability::Note,
        ChunkKind::Analysis => Capability::Analysis,
    }
}

/// Everything a worker must provide to take `chunk`: the kind's capability
/// plus whatever `metadata.requiredCapability` names (a string or an array).
pub fn required_capabilities(chunk: &Chunk) -> Result<BTreeSet<Capability>> {
    let mut required = BTreeSet::from([required_capability(chunk.kind)]);
    match chunk.metadata.get(REQUIRED_CAPABILITY_KEY) {
        None => {}
        Some(serde_json::Value::String(s)) => {
            required.insert(s.parse()?);
        }
        Some(serde_json::Value::Array(values)) => {
            for value in values {
                let name = value.as_str().ok_or_else(|| {
                    Error::Validation(format!("{} entries must be strings", REQUIRED_CAPABILITY_KEY))
                })?;
                required.insert(name.parse()?);
            }
        }
        Some(other) => {
            return Err(Error::Validation(format!(
                "{} must be a string or array, got {}",
                REQUIRED_CAPABILITY_KEY, other
            )))
        }
    }
    Ok(required)
}

pub fn format_capabilities(caps: &BTreeSet<Capability>) -> String {
    caps.iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A worker as the router sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub id: AgentId,
    pub capabilities: BTreeSet<Capability>,
    pub max_concurrent: usize,
    pub current_load: usize,
}

impl AgentRegistration {
    pub fn new(id: AgentId, capabilities: BTreeSet<Capability>, max_concurrent: usize) -> Self {
        Self {
            id,
            capabilities,
            max_concurrent,
            current_load: 0,
        }
    }

    pub fn headroom(&self) -> usize {
        self.max_concurrent.saturating_sub(self.current_load)
    }

    pub fn provides(&self, required: &BTreeSet<Capability>) -> bool {
        self.capabilities.is_superset(required)
    }
}

/// Something that processes chunks.
///
/// The returned string becomes the chunk's `processed_content`. Errors count
/// as failed attempts and are retried by the orchestrator.
pub trait Worker: Send + Sync {
    fn process(&self, chunk: Chunk, action: TacticalAction) -> BoxFuture<'static, Result<String>>;
}
