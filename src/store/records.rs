use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{RecordFilter, RecordKind, RecordStore};
use crate::agent::AgentRegistration;
use crate::core::chunk::{Chunk, ChunkId, ChunkState};
use crate::core::dag::{ChunkDependency, ChunkGraph};
use crate::orchestration::orchestrator::TaskRecord;
use crate::orchestration::oscillator::{CoherenceLogEntry, PhaseState};
use crate::orchestration::resolver::Resolution;
use crate::orchestration::retry::RetryPolicy;
use crate::util::retry_transient;
use crate::{clog_debug, Error, Result};

/// Id of the singleton phase record.
pub const PHASE_RECORD_ID: &str = "current";

/// A persisted resolver decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub chunk_id: Option<ChunkId>,
    pub at: DateTime<Utc>,
    pub resolution: Resolution,
}

impl DecisionRecord {
    pub fn new(chunk_id: Option<ChunkId>, at: DateTime<Utc>, resolution: Resolution) -> Self {
        Self {
            id: timeline_id(at),
            chunk_id,
            at,
            resolution,
        }
    }
}

/// Ids for append-only records that sort chronologically.
fn timeline_id(at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", at.format("%Y%m%dT%H%M%S%.6f"), &suffix[..8])
}

/// Typed access to a [`RecordStore`].
///
/// Remembers the version of every record it has read or written and sends it
/// as the expected version on the next write, so a record changed by some
/// other writer in between is rejected with `ConcurrentModification` instead
/// of being overwritten. Store calls run on the blocking pool, so file I/O
/// never stalls a runtime worker, and transient errors are retried with the
/// policy's backoff.
pub struct Records {
    store: Arc<dyn RecordStore>,
    policy: RetryPolicy,
    versions: Mutex<HashMap<(RecordKind, String), u64>>,
}

impl Records {
    pub fn new(store: Arc<dyn RecordStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            versions: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn known_version(&self, kind: RecordKind, id: &str) -> Option<u64> {
        self.versions
            .lock()
            .ok()
            .and_then(|v| v.get(&(kind, id.to_string())).copied())
    }

    fn remember(&self, kind: RecordKind, id: &str, version: Option<u64>) {
        if let Ok(mut versions) = self.versions.lock() {
            match version {
                Some(v) => {
                    versions.insert((kind, id.to_string()), v);
                }
                None => {
                    versions.remove(&(kind, id.to_string()));
                }
            }
        }
    }

    /// Run a store call on the blocking pool, retrying transient failures.
    async fn call<T, F>(&self, what: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RecordStore) -> Result<T> + Clone + Send + 'static,
    {
        retry_transient(&self.policy, what, || {
            let store = self.store.clone();
            let op = op.clone();
            async move {
                tokio::task::spawn_blocking(move || op(store.as_ref()))
                    .await
                    .map_err(|e| Error::TaskJoin(e.to_string()))?
            }
        })
        .await
    }

    /// Serialize and write `value`, guarded by the last known version.
    pub async fn put<T: Serialize>(&self, kind: RecordKind, id: &str, value: &T) -> Result<u64> {
        let json = serde_json::to_value(value)?;
        let expected = self.known_version(kind, id);
        let what = format!("put {}/{}", kind, id);
        let key = id.to_string();
        let version = self
            .call(&what, move |store| store.put(kind, &key, json, expected))
            .await?;
        self.remember(kind, id, Some(version));
        Ok(version)
    }

    pub async fn get<T: DeserializeOwned>(&self, kind: RecordKind, id: &str) -> Result<Option<T>> {
        let what = format!("get {}/{}", kind, id);
        let key = id.to_string();
        match self.call(&what, move |store| store.get(kind, &key)).await? {
            Some(record) => {
                self.remember(kind, id, Some(record.version));
                Ok(Some(serde_json::from_value(record.value)?))
            }
            None => Ok(None),
        }
    }

    pub async fn list<T: DeserializeOwned>(
        &self,
        kind: RecordKind,
        filter: &RecordFilter,
    ) -> Result<Vec<T>> {
        let what = format!("list {}", kind);
        let filter = filter.clone();
        let records = self
            .call(&what, move |store| store.list(kind, &filter))
            .await?;
        let mut values = Vec::with_capacity(records.len());
        for record in records {
            self.remember(kind, &record.id, Some(record.version));
            values.push(serde_json::from_value(record.value)?);
        }
        Ok(values)
    }

    pub async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool> {
        let what = format!("delete {}/{}", kind, id);
        let key = id.to_string();
        let removed = self
            .call(&what, move |store| store.delete(kind, &key))
            .await?;
        self.remember(kind, id, None);
        Ok(removed)
    }

    // ========== Typed helpers ==========

    pub async fn save_chunk(&self, chunk: &Chunk) -> Result<u64> {
        self.put(RecordKind::Chunk, &chunk.id.to_string(), chunk).await
    }

    pub async fn load_chunk(&self, id: &ChunkId) -> Result<Option<Chunk>> {
        self.get(RecordKind::Chunk, &id.to_string()).await
    }

    pub async fn delete_chunk(&self, id: &ChunkId) -> Result<bool> {
        self.delete(RecordKind::Chunk, &id.to_string()).await
    }

    pub async fn save_dependency(&self, dep: &ChunkDependency) -> Result<u64> {
        self.put(RecordKind::Dependency, &dep.record_id(), dep).await
    }

    pub async fn delete_dependency(&self, dep: &ChunkDependency) -> Result<bool> {
        self.delete(RecordKind::Dependency, &dep.record_id()).await
    }

    pub async fn save_agent(&self, agent: &AgentRegistration) -> Result<u64> {
        self.put(RecordKind::Agent, agent.id.as_str(), agent).await
    }

    /// Persisted registrations with their load reset, since nothing is in
    /// flight after a restart.
    pub async fn load_agents(&self) -> Result<Vec<AgentRegistration>> {
        let mut agents: Vec<AgentRegistration> =
            self.list(RecordKind::Agent, &RecordFilter::All).await?;
        for agent in &mut agents {
            agent.current_load = 0;
        }
        Ok(agents)
    }

    pub async fn save_phase(&self, state: &PhaseState) -> Result<u64> {
        self.put(RecordKind::Phase, PHASE_RECORD_ID, state).await
    }

    pub async fn load_phase(&self) -> Result<Option<PhaseState>> {
        self.get(RecordKind::Phase, PHASE_RECORD_ID).await
    }

    pub async fn append_decision(&self, decision: &DecisionRecord) -> Result<u64> {
        self.put(RecordKind::Decision, &decision.id, decision).await
    }

    pub async fn decisions(&self) -> Result<Vec<DecisionRecord>> {
        self.list(RecordKind::Decision, &RecordFilter::All).await
    }

    pub async fn append_coherence(&self, entry: &CoherenceLogEntry) -> Result<u64> {
        self.put(RecordKind::CoherenceLog, &timeline_id(entry.at), entry)
            .await
    }

    pub async fn coherence_log(&self) -> Result<Vec<CoherenceLogEntry>> {
        self.list(RecordKind::CoherenceLog, &RecordFilter::All).await
    }

    pub async fn save_task(&self, task: &TaskRecord) -> Result<u64> {
        self.put(RecordKind::Task, &task.id.to_string(), task).await
    }

    pub async fn load_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.list(RecordKind::Task, &RecordFilter::All).await
    }

    /// Rebuild the chunk graph from persisted chunks and edges.
    ///
    /// Chunks caught mid-dispatch (`ready`, `assigned`, `processing`) go back
    /// to `created` so the orchestrator re-evaluates them.
    pub async fn load_graph(&self) -> Result<ChunkGraph> {
        let mut chunks: Vec<Chunk> = self.list(RecordKind::Chunk, &RecordFilter::All).await?;
        let dependencies: Vec<ChunkDependency> =
            self.list(RecordKind::Dependency, &RecordFilter::All).await?;

        let mut reset = 0;
        for chunk in &mut chunks {
            if matches!(
                chunk.state,
                ChunkState::Ready | ChunkState::Assigned | ChunkState::Processing
            ) {
                chunk.transition(ChunkState::Created)?;
                chunk.agent_id = None;
                reset += 1;
            }
        }
        clog_debug!(
            "load_graph: {} chunks ({} reset), {} dependencies",
            chunks.len(),
            reset,
            dependencies.len()
        );
        ChunkGraph::from_parts(chunks, dependencies).map_err(|e| match e {
            Error::CycleDetected { .. } | Error::NotFound { .. } | Error::ChunkExists(_) => {
                Error::Store(format!("persisted graph is inconsistent: {}", e))
            }
            other => other,
        })
    }
}

impl std::fmt::Debug for Records {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Records")
            .field("policy", &self.policy)
            .finish()
    }
}
