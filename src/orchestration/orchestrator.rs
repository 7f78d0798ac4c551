//! The orchestration loop.
//!
//! The `Orchestrator` composes the chunk graph, the strategic resolver, the
//! capability router and the phase oscillator. Each [`Orchestrator::tick`]:
//!
//! 1. writes back worker outcomes received since the last tick;
//! 2. advances the oscillator (deferred edges applied and integrity checked
//!    on entering Consolidation, queued admissions released on entering
//!    Emission);
//! 3. re-routes chunks whose retry backoff has elapsed;
//! 4. re-attempts chunks waiting for a capable or free agent;
//! 5. resolves and routes newly ready chunks;
//! 6. dispatches assigned chunks if the phase admits it.
//!
//! Steps 3 to 6 run under the oscillator read guard, so no dispatch decision
//! straddles a phase transition.
//!
//! New dependency edges never touch the graph during Emission. They are
//! validated when submitted, persisted, and applied on the next entry into
//! Consolidation; until then their targets are held in `created`. An edge
//! may only target a chunk that is still `created`.
//!
//! Every chunk record is written before the in-memory change it describes
//! becomes visible, or the chunk is put back on a queue when a write fails,
//! so a store error never strands a chunk outside every queue.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentId, AgentRegistration, Capability, Worker};
use crate::config::{Config, OrchestratorConfig};
use crate::core::chunk::{Chunk, ChunkId, ChunkState, TaskId};
use crate::core::dag::{ChunkDependency, ChunkGraph, GraphSnapshot};
use crate::orchestration::oscillator::{Phase, PhaseOscillator, PhaseStatus, PhaseTransition};
use crate::orchestration::resolver::{StrategicContext, StrategicResolver, TacticalAction};
use crate::orchestration::retry::{RetryPolicy, RetryTracker};
use crate::orchestration::router::CapabilityRouter;
use crate::store::{DecisionRecord, RecordStore, Records};
use crate::util::with_timeout;
use crate::{clog, clog_debug, clog_error, clog_trace, clog_warn, Error, Result};

/// Status of a decomposed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TaskStatus {
    Active,
    Completed,
    /// A chunk exhausted its retries; carries the originating error.
    Failed { error: String },
    Cancelled,
}

impl TaskStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Active)
    }
}

/// Persisted per-task bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    #[serde(flatten)]
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: TaskId) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Whether a submission took effect immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Chunks added to the graph. Edges wait for the next Consolidation.
    Admitted,
    /// Validated and held until the next Emission phase.
    Queued,
}

/// Events published on the optional event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    PhaseChanged(PhaseTransition),
    ChunkStateChanged { chunk_id: ChunkId, state: ChunkState },
    TaskStatusChanged { task_id: TaskId, status: TaskStatus },
}

/// What a single tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub transitions: Vec<PhaseTransition>,
    pub dispatched: Vec<ChunkId>,
    pub resolved: Vec<ChunkId>,
    pub retried: Vec<ChunkId>,
    /// Chunks that could not be routed this tick and were queued.
    pub unroutable: Vec<ChunkId>,
    /// Terminal failures, each a `ProcessingFailed`.
    pub failed: Vec<Error>,
    /// Admissions released into the graph on entering Emission.
    pub admitted: usize,
    /// Deferred edges applied on entering Consolidation.
    pub edges_applied: usize,
}

impl TickReport {
    pub fn merge(&mut self, other: TickReport) {
        self.transitions.extend(other.transitions);
        self.dispatched.extend(other.dispatched);
        self.resolved.extend(other.resolved);
        self.retried.extend(other.retried);
        self.unroutable.extend(other.unroutable);
        self.failed.extend(other.failed);
        self.admitted += other.admitted;
        self.edges_applied += other.edges_applied;
    }

    pub fn is_quiet(&self) -> bool {
        self.transitions.is_empty()
            && self.dispatched.is_empty()
            && self.resolved.is_empty()
            && self.retried.is_empty()
            && self.failed.is_empty()
    }
}

/// Result of one worker call, sent back to the loop.
#[derive(Debug)]
pub struct WorkerOutcome {
    pub chunk_id: ChunkId,
    pub agent_id: AgentId,
    pub result: Result<String>,
}

struct Assignment {
    chunk_id: ChunkId,
    agent_id: AgentId,
    action: TacticalAction,
    signature: String,
}

struct InFlight {
    agent_id: AgentId,
    action: TacticalAction,
    signature: String,
    token: CancellationToken,
}

struct PendingRoute {
    chunk_id: ChunkId,
    action: TacticalAction,
    signature: String,
    since: DateTime<Utc>,
    warned: bool,
}

struct Admission {
    chunks: Vec<Chunk>,
    dependencies: Vec<ChunkDependency>,
}

#[derive(Default)]
struct DispatchState {
    in_flight: HashMap<ChunkId, InFlight>,
    /// Assigned chunks waiting for the Emission phase.
    pending_dispatch: VecDeque<Assignment>,
    /// Ready chunks no agent could take yet.
    pending_route: VecDeque<PendingRoute>,
    retries: RetryTracker,
    /// Submissions validated during Consolidation.
    queued_admissions: VecDeque<Admission>,
    /// Persisted edges waiting for the next Consolidation window.
    deferred_edges: Vec<ChunkDependency>,
    /// Outcomes whose write-back failed; applied first on the next tick.
    unapplied: VecDeque<WorkerOutcome>,
    tasks: HashMap<TaskId, TaskRecord>,
    integrity_issues: usize,
}

impl DispatchState {
    fn tracked(&self) -> HashSet<ChunkId> {
        self.in_flight
            .keys()
            .copied()
            .chain(self.pending_dispatch.iter().map(|a| a.chunk_id))
            .collect()
    }

    fn workload_drained(&self) -> bool {
        self.in_flight.is_empty()
            && self.pending_dispatch.is_empty()
            && self.pending_route.is_empty()
            && self.retries.is_empty()
            && self.unapplied.is_empty()
    }

    /// Edges accepted but not yet in the graph.
    fn pending_edges(&self) -> impl Iterator<Item = &ChunkDependency> {
        self.deferred_edges.iter().chain(
            self.queued_admissions
                .iter()
                .flat_map(|a| a.dependencies.iter()),
        )
    }

    /// Chunks held in `created` until their pending edges are applied.
    fn held(&self) -> HashSet<ChunkId> {
        self.pending_edges().map(|d| d.target).collect()
    }

    fn is_waiting(&self, id: &ChunkId) -> bool {
        self.retries.contains(id) || self.pending_route.iter().any(|p| &p.chunk_id == id)
    }
}

/// Ready chunks not held back by a pending edge.
fn schedulable<'g>(graph: &'g ChunkGraph, state: &DispatchState) -> Vec<&'g Chunk> {
    let held = state.held();
    graph
        .ready_chunks()
        .into_iter()
        .filter(|c| !held.contains(&c.id))
        .collect()
}

/// Composition root of the scheduling domain.
///
/// Lock order: oscillator, graph, resolver, router, state.
pub struct Orchestrator {
    config: OrchestratorConfig,
    retry: RetryPolicy,
    graph: RwLock<ChunkGraph>,
    oscillator: RwLock<PhaseOscillator>,
    resolver: RwLock<StrategicResolver>,
    router: Mutex<CapabilityRouter>,
    state: Mutex<DispatchState>,
    /// Serializes ticks.
    tick_lock: Mutex<()>,
    records: Records,
    worker: Arc<dyn Worker>,
    outcome_tx: mpsc::UnboundedSender<WorkerOutcome>,
    outcome_rx: Mutex<mpsc::UnboundedReceiver<WorkerOutcome>>,
    event_tx: Option<mpsc::Sender<OrchestratorEvent>>,
    dropped_events: AtomicU64,
}

impl Orchestrator {
    /// Build an orchestrator with an empty graph, a fresh oscillator starting
    /// now and a resolver with default weights.
    pub fn new(config: &Config, store: Arc<dyn RecordStore>, worker: Arc<dyn Worker>) -> Result<Self> {
        config.validate()?;
        let oscillator = PhaseOscillator::new(config.oscillator.clone(), Utc::now())?;
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config: config.orchestrator.clone(),
            retry: config.retry.clone(),
            graph: RwLock::new(ChunkGraph::new()),
            oscillator: RwLock::new(oscillator),
            resolver: RwLock::new(StrategicResolver::default()),
            router: Mutex::new(CapabilityRouter::new()),
            state: Mutex::new(DispatchState::default()),
            tick_lock: Mutex::new(()),
            records: Records::new(store, config.retry.clone()),
            worker,
            outcome_tx,
            outcome_rx: Mutex::new(outcome_rx),
            event_tx: None,
            dropped_events: AtomicU64::new(0),
        })
    }

    /// Rebuild from whatever the store holds: graph, phase state, agent
    /// registrations and tasks. Persisted edges that were still deferred
    /// come back as part of the graph.
    pub async fn restore(
        config: &Config,
        store: Arc<dyn RecordStore>,
        worker: Arc<dyn Worker>,
    ) -> Result<Self> {
        let orchestrator = Self::new(config, store, worker)?;
        let graph = orchestrator.records.load_graph().await?;
        let oscillator = match orchestrator.records.load_phase().await? {
            Some(state) => PhaseOscillator::restore(config.oscillator.clone(), state)?,
            None => PhaseOscillator::new(config.oscillator.clone(), Utc::now())?,
        };
        let agents = orchestrator.records.load_agents().await?;
        let tasks = orchestrator.records.load_tasks().await?;
        clog!(
            "Restored {} chunks, {} agents, {} tasks; phase {}",
            graph.chunk_count(),
            agents.len(),
            tasks.len(),
            oscillator.phase()
        );

        *orchestrator.graph.write().await = graph;
        *orchestrator.oscillator.write().await = oscillator;
        {
            let mut router = orchestrator.router.lock().await;
            for agent in agents {
                router.register(agent.id, agent.capabilities, agent.max_concurrent)?;
            }
        }
        {
            let mut state = orchestrator.state.lock().await;
            state.tasks = tasks.into_iter().map(|t| (t.id, t)).collect();
        }
        Ok(orchestrator)
    }

    pub fn with_resolver(mut self, resolver: StrategicResolver) -> Self {
        self.resolver = RwLock::new(resolver);
        self
    }

    pub fn with_oscillator(mut self, oscillator: PhaseOscillator) -> Self {
        self.oscillator = RwLock::new(oscillator);
        self
    }

    /// Open the event channel. Events are dropped when the receiver lags.
    pub fn subscribe(&mut self) -> mpsc::Receiver<OrchestratorEvent> {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        self.event_tx = Some(tx);
        rx
    }

    pub fn records(&self) -> &Records {
        &self.records
    }

    /// Events dropped because the subscriber lagged.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    fn emit(&self, event: OrchestratorEvent) {
        let Some(tx) = &self.event_tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped_events.fetch_add(1, Ordering::Relaxed) + 1;
                clog_trace!("Event channel full, dropped {:?} ({} so far)", event, dropped);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    // ========== Admission API ==========

    /// Admit a chunk together with edges touching it.
    ///
    /// Every dependency must have the new chunk as source or target, and its
    /// other endpoint must already exist. Nothing is applied unless all edges
    /// are valid. During Consolidation the submission is validated now and
    /// admitted when Emission resumes.
    pub async fn submit_chunk(
        &self,
        chunk: Chunk,
        dependencies: Vec<ChunkDependency>,
    ) -> Result<SubmitOutcome> {
        for dep in &dependencies {
            if dep.source != chunk.id && dep.target != chunk.id {
                return Err(Error::Validation(format!(
                    "dependency {} does not involve chunk {}",
                    dep.record_id(),
                    chunk.id
                )));
            }
        }
        self.submit_batch(vec![chunk], dependencies).await
    }

    /// Admit several chunks and edges atomically. Edges may reference chunks
    /// anywhere in the batch or already in the graph, but an existing target
    /// must still be `created`.
    pub async fn submit_batch(
        &self,
        chunks: Vec<Chunk>,
        dependencies: Vec<ChunkDependency>,
    ) -> Result<SubmitOutcome> {
        if chunks.is_empty() {
            return Err(Error::Validation("empty submission".to_string()));
        }
        if let Some(chunk) = chunks.iter().find(|c| c.state != ChunkState::Created) {
            return Err(Error::Validation(format!(
                "chunk {} must be submitted in the created state, not {}",
                chunk.id,
                chunk.state.name()
            )));
        }

        let oscillator = self.oscillator.read().await;
        let mut graph = self.graph.write().await;
        let mut state = self.state.lock().await;

        let admission = Admission {
            chunks,
            dependencies,
        };
        // Validate against everything already accepted, applied or not.
        let mut candidate = graph.clone();
        for dep in &state.deferred_edges {
            add_edge(&mut candidate, dep)?;
        }
        for queued in &state.queued_admissions {
            apply_admission(&mut candidate, queued)?;
        }
        apply_admission(&mut candidate, &admission)?;
        check_edge_targets(&graph, &admission.dependencies)?;

        if oscillator.phase() == Phase::Consolidation {
            clog_debug!(
                "Queued admission of {} chunks until emission",
                admission.chunks.len()
            );
            state.queued_admissions.push_back(admission);
            return Ok(SubmitOutcome::Queued);
        }

        self.admit(&mut graph, &mut state, &admission).await?;
        Ok(SubmitOutcome::Admitted)
    }

    /// Persist an admission, then add its chunks to the graph. Its edges
    /// wait for the next Consolidation window.
    async fn admit(
        &self,
        graph: &mut ChunkGraph,
        state: &mut DispatchState,
        admission: &Admission,
    ) -> Result<()> {
        self.persist_admission(state, admission).await?;
        for chunk in &admission.chunks {
            clog!(
                "Admitted chunk {} ({}, {} bytes)",
                chunk.id.short(),
                chunk.kind,
                chunk.content().len()
            );
            graph.add_chunk(chunk.clone())?;
        }
        if !admission.dependencies.is_empty() {
            clog_debug!(
                "Deferred {} edges until consolidation",
                admission.dependencies.len()
            );
        }
        state
            .deferred_edges
            .extend(admission.dependencies.iter().cloned());
        Ok(())
    }

    async fn persist_admission(&self, state: &mut DispatchState, admission: &Admission) -> Result<()> {
        for chunk in &admission.chunks {
            self.records.save_chunk(chunk).await?;
            if let Some(task_id) = chunk.parent_task_id {
                let task = state
                    .tasks
                    .entry(task_id)
                    .or_insert_with(|| TaskRecord::new(task_id));
                if task.status == TaskStatus::Completed {
                    task.status = TaskStatus::Active;
                }
                task.updated_at = Utc::now();
                let task = task.clone();
                self.records.save_task(&task).await?;
            }
        }
        for dep in &admission.dependencies {
            self.records.save_dependency(dep).await?;
        }
        Ok(())
    }

    /// Release admissions queued during Consolidation, oldest first. One that
    /// fails to persist stays at the head of the queue.
    async fn release_admissions(
        &self,
        graph: &mut ChunkGraph,
        state: &mut DispatchState,
        report: &mut TickReport,
    ) -> Result<()> {
        while let Some(admission) = state.queued_admissions.pop_front() {
            let mut candidate = graph.clone();
            let valid = state
                .deferred_edges
                .iter()
                .try_for_each(|dep| add_edge(&mut candidate, dep))
                .and_then(|()| apply_admission(&mut candidate, &admission))
                .and_then(|()| check_edge_targets(graph, &admission.dependencies));
            if let Err(e) = valid {
                clog_error!("Dropping queued admission: {}", e);
                continue;
            }
            if let Err(e) = self.admit(graph, state, &admission).await {
                state.queued_admissions.push_front(admission);
                return Err(e);
            }
            report.admitted += admission.chunks.len();
        }
        Ok(())
    }

    /// Add deferred edges to the graph. They were validated and persisted on
    /// submission.
    fn apply_deferred_edges(graph: &mut ChunkGraph, state: &mut DispatchState) -> usize {
        let edges = std::mem::take(&mut state.deferred_edges);
        let mut applied = 0;
        for dep in &edges {
            match add_edge(graph, dep) {
                Ok(()) => applied += 1,
                Err(e) => clog_error!("Dropping deferred edge {}: {}", dep.record_id(), e),
            }
        }
        if applied > 0 {
            clog_debug!("Applied {} deferred edges", applied);
        }
        applied
    }

    /// Remove a chunk and its edges.
    ///
    /// Structural removal happens only during Consolidation, and never for a
    /// chunk that is being dispatched or that a pending edge names.
    pub async fn remove_chunk(&self, id: &ChunkId) -> Result<Chunk> {
        let oscillator = self.oscillator.read().await;
        if oscillator.phase() != Phase::Consolidation {
            return Err(Error::Validation(
                "chunks can only be removed during consolidation".to_string(),
            ));
        }
        let mut graph = self.graph.write().await;
        let state = self.state.lock().await;
        let chunk = graph
            .get_chunk(id)
            .ok_or_else(|| Error::not_found("chunk", id))?;
        if matches!(
            chunk.state,
            ChunkState::Ready | ChunkState::Assigned | ChunkState::Processing
        ) {
            return Err(Error::Validation(format!(
                "chunk {} is {} and cannot be removed",
                id,
                chunk.state.name()
            )));
        }
        if state
            .pending_edges()
            .any(|d| &d.source == id || &d.target == id)
        {
            return Err(Error::Validation(format!(
                "chunk {} is named by a dependency not yet applied",
                id
            )));
        }
        let edges: Vec<ChunkDependency> = graph
            .dependencies()
            .into_iter()
            .filter(|d| &d.source == id || &d.target == id)
            .cloned()
            .collect();
        for dep in &edges {
            self.records.delete_dependency(dep).await?;
        }
        self.records.delete_chunk(id).await?;
        let removed = graph.remove_chunk(id)?;
        clog!("Removed chunk {} and {} edges", id.short(), edges.len());
        Ok(removed)
    }

    /// Register (or re-register) a worker.
    pub async fn register_agent(
        &self,
        id: AgentId,
        capabilities: BTreeSet<Capability>,
        max_concurrent: usize,
    ) -> Result<AgentRegistration> {
        let registration = self
            .router
            .lock()
            .await
            .register(id, capabilities, max_concurrent)?;
        self.records.save_agent(&registration).await?;
        Ok(registration)
    }

    pub async fn deregister_agent(&self, id: &AgentId) -> Result<AgentRegistration> {
        let removed = self.router.lock().await.deregister(id)?;
        self.records.delete(crate::store::RecordKind::Agent, id.as_str()).await?;
        Ok(removed)
    }

    /// Chunks whose sources are resolved and that no pending edge holds back.
    pub async fn get_ready_chunks(&self) -> Vec<Chunk> {
        let graph = self.graph.read().await;
        let state = self.state.lock().await;
        schedulable(&graph, &state).into_iter().cloned().collect()
    }

    pub async fn get_chunk(&self, id: &ChunkId) -> Option<Chunk> {
        self.graph.read().await.get_chunk(id).cloned()
    }

    pub async fn snapshot(&self) -> GraphSnapshot {
        self.graph.read().await.snapshot()
    }

    /// Edges accepted but not yet applied to the graph.
    pub async fn pending_dependencies(&self) -> Vec<ChunkDependency> {
        self.state.lock().await.pending_edges().cloned().collect()
    }

    pub async fn agents(&self) -> Vec<AgentRegistration> {
        self.router.lock().await.agents().to_vec()
    }

    pub async fn task(&self, id: &TaskId) -> Option<TaskRecord> {
        self.state.lock().await.tasks.get(id).cloned()
    }

    pub async fn resolver(&self) -> StrategicResolver {
        self.resolver.read().await.clone()
    }

    pub async fn get_phase_status(&self) -> PhaseStatus {
        self.phase_status_at(Utc::now()).await
    }

    pub async fn phase_status_at(&self, now: DateTime<Utc>) -> PhaseStatus {
        let oscillator = self.oscillator.read().await;
        let mut status = oscillator.status(now);
        status.integrity_issues = self.state.lock().await.integrity_issues;
        status
    }

    pub async fn force_transition(&self) -> Result<PhaseTransition> {
        self.force_transition_at(Utc::now()).await
    }

    /// Flip phase now, with the same side effects as an organic transition.
    pub async fn force_transition_at(&self, now: DateTime<Utc>) -> Result<PhaseTransition> {
        let mut oscillator = self.oscillator.write().await;
        let transition = oscillator.force_transition(now);
        let mut report = TickReport::default();
        self.after_transition(&mut oscillator, &transition, &mut report)
            .await?;
        Ok(transition)
    }

    /// Persist the current oscillator state.
    pub async fn persist_phase(&self) -> Result<()> {
        let oscillator = self.oscillator.read().await;
        self.records.save_phase(oscillator.state()).await?;
        Ok(())
    }

    /// Nothing in flight, queued, pending or ready.
    pub async fn is_idle(&self) -> bool {
        let graph = self.graph.read().await;
        let state = self.state.lock().await;
        state.workload_drained()
            && state.queued_admissions.is_empty()
            && state.deferred_edges.is_empty()
            && schedulable(&graph, &state).is_empty()
    }

    // ========== Archive / cancel ==========

    /// Move a terminal chunk to `archived`. Resolved chunks keep satisfying
    /// their dependents.
    pub async fn archive_chunk(&self, id: &ChunkId) -> Result<()> {
        let mut graph = self.graph.write().await;
        let chunk = graph
            .get_chunk_mut(id)
            .ok_or_else(|| Error::not_found("chunk", id))?;
        let resolved = chunk.state == ChunkState::Resolved;
        let mut archived = chunk.clone();
        archived.transition(ChunkState::Archived { resolved })?;
        self.records.save_chunk(&archived).await?;
        *chunk = archived;
        self.emit(OrchestratorEvent::ChunkStateChanged {
            chunk_id: *id,
            state: chunk.state.clone(),
        });
        Ok(())
    }

    /// Cancel a chunk and every unresolved chunk decomposed from it.
    pub async fn cancel_chunk(&self, id: &ChunkId) -> Result<Vec<ChunkId>> {
        let mut graph = self.graph.write().await;
        if !graph.contains_chunk(id) {
            return Err(Error::not_found("chunk", id));
        }
        let ids = graph.hierarchy_closure(&[*id]);
        let mut router = self.router.lock().await;
        let mut state = self.state.lock().await;
        let reason = format!("chunk {} cancelled", id.short());
        self.cancel_chunks(&mut graph, &mut router, &mut state, &ids, &reason)
            .await
    }

    /// Cancel every unresolved chunk of a task, transitively, and mark the
    /// task cancelled.
    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<Vec<ChunkId>> {
        let mut graph = self.graph.write().await;
        let ids = graph.task_chunks(task_id);
        let mut router = self.router.lock().await;
        let mut state = self.state.lock().await;
        if ids.is_empty() && !state.tasks.contains_key(task_id) {
            return Err(Error::not_found("task", task_id));
        }
        let reason = format!("task {} cancelled", task_id);
        let cancelled = self
            .cancel_chunks(&mut graph, &mut router, &mut state, &ids, &reason)
            .await?;

        let task = state
            .tasks
            .entry(*task_id)
            .or_insert_with(|| TaskRecord::new(*task_id));
        task.status = TaskStatus::Cancelled;
        task.updated_at = Utc::now();
        let task = task.clone();
        self.records.save_task(&task).await?;
        self.emit(OrchestratorEvent::TaskStatusChanged {
            task_id: *task_id,
            status: TaskStatus::Cancelled,
        });
        clog!("Cancelled task {}: {} chunks", task_id, cancelled.len());
        Ok(cancelled)
    }

    /// Chunks whose record fails to write keep their state and queues, so
    /// the call can be repeated.
    async fn cancel_chunks(
        &self,
        graph: &mut ChunkGraph,
        router: &mut CapabilityRouter,
        state: &mut DispatchState,
        ids: &[ChunkId],
        reason: &str,
    ) -> Result<Vec<ChunkId>> {
        let mut cancelled = Vec::new();
        for id in ids {
            let Some(chunk) = graph.get_chunk_mut(id) else {
                continue;
            };
            if chunk.is_terminal() {
                continue;
            }
            let mut updated = chunk.clone();
            updated.transition(ChunkState::Cancelled {
                reason: reason.to_string(),
            })?;
            self.records.save_chunk(&updated).await?;
            *chunk = updated;

            if let Some(flight) = state.in_flight.remove(id) {
                flight.token.cancel();
                release_agent(router, &flight.agent_id);
            }
            if let Some(pos) = state.pending_dispatch.iter().position(|a| &a.chunk_id == id) {
                if let Some(assignment) = state.pending_dispatch.remove(pos) {
                    release_agent(router, &assignment.agent_id);
                }
            }
            state.pending_route.retain(|p| &p.chunk_id != id);
            state.retries.remove(id);

            self.emit(OrchestratorEvent::ChunkStateChanged {
                chunk_id: *id,
                state: chunk.state.clone(),
            });
            cancelled.push(*id);
        }
        clog_debug!("{}: {} chunks cancelled", reason, cancelled.len());
        Ok(cancelled)
    }

    // ========== The loop ==========

    /// Run one scheduling pass as of `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let _serial = self.tick_lock.lock().await;
        let mut report = TickReport::default();

        self.drain_outcomes(now, &mut report).await?;

        {
            let mut oscillator = self.oscillator.write().await;
            if oscillator.phase() == Phase::Emission {
                let graph = self.graph.read().await;
                let state = self.state.lock().await;
                let drained = state.workload_drained() && schedulable(&graph, &state).is_empty();
                oscillator.set_completion(drained);
            }
            if let Some(transition) = oscillator.tick(now) {
                self.after_transition(&mut oscillator, &transition, &mut report)
                    .await?;
            }
        }

        // Quiesce barrier: transitions wait for this guard.
        let oscillator = self.oscillator.read().await;
        let mut graph = self.graph.write().await;
        let resolver = self.resolver.read().await;
        let mut router = self.router.lock().await;
        let mut state = self.state.lock().await;

        // Leftovers from a release that failed at the phase boundary.
        if oscillator.phase() == Phase::Emission && !state.queued_admissions.is_empty() {
            self.release_admissions(&mut graph, &mut state, &mut report)
                .await?;
        }

        let mut to_route: VecDeque<ChunkId> = state.retries.take_due(now).into();

        let mut waiting = std::mem::take(&mut state.pending_route);
        while let Some(pending) = waiting.pop_front() {
            let still_ready = graph
                .get_chunk(&pending.chunk_id)
                .map(|c| c.state == ChunkState::Ready)
                .unwrap_or(false);
            if !still_ready {
                continue;
            }
            if let Err(e) = self
                .route_chunk(&mut graph, &mut router, &mut state, pending, now, &mut report)
                .await
            {
                state.pending_route.extend(waiting);
                requeue_ready(&graph, &mut state, to_route, now);
                return Err(e);
            }
        }

        to_route.extend(schedulable(&graph, &state).into_iter().map(|c| c.id));
        while let Some(id) = to_route.pop_front() {
            if let Err(e) = self
                .resolve_and_route(&mut graph, &resolver, &mut router, &mut state, id, now, &mut report)
                .await
            {
                to_route.push_front(id);
                requeue_ready(&graph, &mut state, to_route, now);
                return Err(e);
            }
        }

        if oscillator.admits_dispatch() {
            while let Some(assignment) = state.pending_dispatch.pop_front() {
                self.dispatch(&mut graph, &mut state, assignment, &mut report)
                    .await?;
            }
        } else if !state.pending_dispatch.is_empty() {
            clog_trace!(
                "{} assigned chunks held until emission",
                state.pending_dispatch.len()
            );
        }

        Ok(report)
    }

    /// Tick every `tick_ms` until the orchestrator is idle.
    ///
    /// Chunks that can never be routed keep it busy, so a deadline is
    /// required.
    pub async fn run_until_idle(&self, deadline: Duration) -> Result<TickReport> {
        let started = Instant::now();
        let mut summary = TickReport::default();
        loop {
            let report = self.tick(Utc::now()).await?;
            summary.merge(report);
            if self.is_idle().await {
                self.persist_phase().await?;
                return Ok(summary);
            }
            if started.elapsed() >= deadline {
                return Err(Error::Timeout(deadline));
            }
            tokio::time::sleep(self.config.tick_interval()).await;
        }
    }

    async fn after_transition(
        &self,
        oscillator: &mut PhaseOscillator,
        transition: &PhaseTransition,
        report: &mut TickReport,
    ) -> Result<()> {
        if transition.to == Phase::Consolidation {
            let mut graph = self.graph.write().await;
            let mut state = self.state.lock().await;
            report.edges_applied += Self::apply_deferred_edges(&mut graph, &mut state);
            let issues = graph.integrity_issues(&state.tracked());
            for issue in &issues {
                clog_warn!("Integrity: {}", issue);
            }
            state.integrity_issues = issues.len();
            oscillator.set_completion(true);
        }

        self.emit(OrchestratorEvent::PhaseChanged(transition.clone()));
        report.transitions.push(transition.clone());
        self.records.save_phase(oscillator.state()).await?;
        self.records
            .append_coherence(&oscillator.coherence_entry(transition))
            .await?;

        if transition.to == Phase::Emission {
            let mut graph = self.graph.write().await;
            let mut state = self.state.lock().await;
            self.release_admissions(&mut graph, &mut state, report)
                .await?;
        }
        Ok(())
    }

    fn mark_ready(&self, graph: &mut ChunkGraph, id: ChunkId) -> Result<()> {
        let chunk = graph
            .get_chunk_mut(&id)
            .ok_or_else(|| Error::not_found("chunk", id))?;
        if chunk.state == ChunkState::Created {
            chunk.transition(ChunkState::Ready)?;
            self.emit(OrchestratorEvent::ChunkStateChanged {
                chunk_id: id,
                state: ChunkState::Ready,
            });
        }
        Ok(())
    }

    /// Pick an action for a `created` or `ready` chunk, record the decision
    /// and route it. The chunk only leaves `created` once the decision is
    /// stored.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_and_route(
        &self,
        graph: &mut ChunkGraph,
        resolver: &StrategicResolver,
        router: &mut CapabilityRouter,
        state: &mut DispatchState,
        id: ChunkId,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let Some(chunk) = graph.get_chunk(&id) else {
            return Ok(());
        };
        if !matches!(chunk.state, ChunkState::Created | ChunkState::Ready) {
            return Ok(());
        }
        let context = StrategicContext::for_chunk(chunk);
        let resolution = match resolver.resolve(&context) {
            Ok(resolution) => resolution,
            Err(e @ Error::ResolutionAmbiguous { .. }) => {
                self.mark_ready(graph, id)?;
                return self
                    .fail_chunk(graph, state, id, e.to_string(), report)
                    .await;
            }
            Err(e) => return Err(e),
        };
        self.records
            .append_decision(&DecisionRecord::new(Some(id), now, resolution.clone()))
            .await?;
        self.mark_ready(graph, id)?;
        let pending = PendingRoute {
            chunk_id: id,
            action: resolution.chosen,
            signature: context.signature(),
            since: now,
            warned: false,
        };
        self.route_chunk(graph, router, state, pending, now, report)
            .await
    }

    /// Route a ready chunk. Whatever happens, the chunk ends up assigned,
    /// failed, or back in `pending_route`.
    async fn route_chunk(
        &self,
        graph: &mut ChunkGraph,
        router: &mut CapabilityRouter,
        state: &mut DispatchState,
        mut pending: PendingRoute,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let id = pending.chunk_id;
        let chunk = graph
            .get_chunk_mut(&id)
            .ok_or_else(|| Error::not_found("chunk", id))?;
        match router.route(chunk) {
            Ok(agent_id) => {
                state.pending_dispatch.push_back(Assignment {
                    chunk_id: id,
                    agent_id: agent_id.clone(),
                    action: pending.action,
                    signature: pending.signature,
                });
                self.emit(OrchestratorEvent::ChunkStateChanged {
                    chunk_id: id,
                    state: ChunkState::Assigned,
                });
                // Assigned chunks restore as `created`, so a lagging record
                // is harmless.
                self.records.save_chunk(chunk).await?;
                if let Some(agent) = router.get(&agent_id) {
                    self.records.save_agent(agent).await?;
                }
                Ok(())
            }
            Err(e @ (Error::NoCapableAgent { .. } | Error::AgentsBusy { .. })) => {
                let waited = (now - pending.since).to_std().unwrap_or_default();
                if !pending.warned && waited >= self.config.unroutable_warn_after() {
                    clog_warn!("Chunk {} still unroutable after {:?}: {}", id.short(), waited, e);
                    pending.warned = true;
                }
                if pending.since == now {
                    report.unroutable.push(id);
                }
                state.pending_route.push_back(pending);
                Ok(())
            }
            Err(e) => {
                if let Err(write) = self
                    .fail_chunk(graph, state, id, e.to_string(), report)
                    .await
                {
                    state.pending_route.push_back(pending);
                    return Err(write);
                }
                Ok(())
            }
        }
    }

    async fn dispatch(
        &self,
        graph: &mut ChunkGraph,
        state: &mut DispatchState,
        assignment: Assignment,
        report: &mut TickReport,
    ) -> Result<()> {
        let id = assignment.chunk_id;
        let chunk = graph
            .get_chunk_mut(&id)
            .ok_or_else(|| Error::not_found("chunk", id))?;
        chunk.transition(ChunkState::Processing)?;
        let processing = chunk.clone();

        let token = CancellationToken::new();
        let work = self
            .worker
            .process(processing.clone(), assignment.action.clone());
        let tx = self.outcome_tx.clone();
        let cancelled = token.clone();
        let timeout = self.config.processing_timeout();
        let agent_id = assignment.agent_id.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancelled.cancelled() => Err(Error::Cancelled(id)),
                result = with_timeout(timeout, work) => result,
            };
            let _ = tx.send(WorkerOutcome {
                chunk_id: id,
                agent_id,
                result,
            });
        });

        clog!(
            "Dispatched chunk {} to {} as '{}' (attempt {})",
            id.short(),
            assignment.agent_id,
            assignment.action.action,
            processing.attempts + 1
        );
        state.in_flight.insert(
            id,
            InFlight {
                agent_id: assignment.agent_id,
                action: assignment.action,
                signature: assignment.signature,
                token,
            },
        );
        report.dispatched.push(id);
        self.emit(OrchestratorEvent::ChunkStateChanged {
            chunk_id: id,
            state: ChunkState::Processing,
        });
        // The chunk is tracked in flight; processing chunks restore as
        // `created`, so a lagging record is harmless.
        self.records.save_chunk(&processing).await?;
        Ok(())
    }

    /// Apply worker outcomes. An outcome whose write-back fails stays queued
    /// with everything behind it and is applied again on the next tick.
    async fn drain_outcomes(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let mut graph = self.graph.write().await;
        let mut resolver = self.resolver.write().await;
        let mut router = self.router.lock().await;
        let mut state = self.state.lock().await;
        {
            let mut rx = self.outcome_rx.lock().await;
            while let Ok(outcome) = rx.try_recv() {
                state.unapplied.push_back(outcome);
            }
        }

        while let Some(outcome) = state.unapplied.pop_front() {
            if let Err(e) = self
                .apply_outcome(&mut graph, &mut resolver, &mut router, &mut state, &outcome, now, report)
                .await
            {
                state.unapplied.push_front(outcome);
                return Err(e);
            }
        }
        Ok(())
    }

    /// The chunk record is written first. Once it is stored the chunk leaves
    /// flight, so a later failure makes a repeat of this call a no-op.
    #[allow(clippy::too_many_arguments)]
    async fn apply_outcome(
        &self,
        graph: &mut ChunkGraph,
        resolver: &mut StrategicResolver,
        router: &mut CapabilityRouter,
        state: &mut DispatchState,
        outcome: &WorkerOutcome,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let id = outcome.chunk_id;
        // Cancelled chunks were already removed from flight.
        let Some(flight) = state.in_flight.get(&id) else {
            clog_trace!("Ignoring outcome for chunk {} no longer in flight", id.short());
            return Ok(());
        };
        let signature = flight.signature.clone();
        let action = flight.action.action.clone();
        let mut updated = graph
            .get_chunk(&id)
            .ok_or_else(|| Error::not_found("chunk", id))?
            .clone();

        let failure = match &outcome.result {
            Ok(output) => {
                updated.resolve(output.clone())?;
                None
            }
            Err(e) => {
                updated.attempts += 1;
                if self.retry.should_retry(updated.attempts) {
                    updated.transition(ChunkState::Ready)?;
                } else {
                    updated.fail(&e.to_string())?;
                }
                Some(e.to_string())
            }
        };
        self.records.save_chunk(&updated).await?;

        let attempts = updated.attempts;
        let task_id = updated.parent_task_id;
        let state_now = updated.state.clone();
        if let Some(slot) = graph.get_chunk_mut(&id) {
            *slot = updated;
        }
        if let Some(flight) = state.in_flight.remove(&id) {
            release_agent(router, &flight.agent_id);
        }
        resolver.record_outcome(&signature, &action, failure.is_none());

        match failure {
            None => {
                clog!("Chunk {} resolved by {}", id.short(), outcome.agent_id);
                self.emit(OrchestratorEvent::ChunkStateChanged {
                    chunk_id: id,
                    state: ChunkState::Resolved,
                });
                report.resolved.push(id);
            }
            Some(error) if state_now == ChunkState::Ready => {
                let delay = self.retry.backoff(attempts);
                clog_warn!(
                    "Chunk {} attempt {} failed: {}; retrying in {:?}",
                    id.short(),
                    attempts,
                    error,
                    delay
                );
                let due = now
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                state.retries.schedule(id, due);
                report.retried.push(id);
            }
            Some(error) => {
                self.surface_failure(state, id, attempts, task_id, error, report)
                    .await?;
            }
        }

        if state_now == ChunkState::Resolved {
            if let Some(task_id) = task_id {
                self.check_task_completion(graph, state, task_id).await?;
            }
        }
        if let Some(agent) = router.get(&outcome.agent_id) {
            self.records.save_agent(agent).await?;
        }
        Ok(())
    }

    /// Mark a chunk failed. The graph only changes once the record is stored.
    async fn fail_chunk(
        &self,
        graph: &mut ChunkGraph,
        state: &mut DispatchState,
        id: ChunkId,
        error: String,
        report: &mut TickReport,
    ) -> Result<()> {
        let chunk = graph
            .get_chunk_mut(&id)
            .ok_or_else(|| Error::not_found("chunk", id))?;
        let mut failed = chunk.clone();
        failed.fail(&error)?;
        self.records.save_chunk(&failed).await?;
        let attempts = failed.attempts;
        let task_id = failed.parent_task_id;
        *chunk = failed;
        self.surface_failure(state, id, attempts, task_id, error, report)
            .await
    }

    /// Report a terminal failure and fail the owning task.
    async fn surface_failure(
        &self,
        state: &mut DispatchState,
        id: ChunkId,
        attempts: u32,
        task_id: Option<TaskId>,
        error: String,
        report: &mut TickReport,
    ) -> Result<()> {
        let failure = Error::ProcessingFailed {
            chunk_id: id,
            attempts,
            error: error.clone(),
        };
        clog_error!("{}", failure);
        self.emit(OrchestratorEvent::ChunkStateChanged {
            chunk_id: id,
            state: ChunkState::Failed {
                error: error.clone(),
            },
        });
        report.failed.push(failure);

        if let Some(task_id) = task_id {
            let status = TaskStatus::Failed {
                error: format!("chunk {}: {}", id, error),
            };
            self.set_task_status(state, task_id, status).await?;
        }
        Ok(())
    }

    async fn check_task_completion(
        &self,
        graph: &ChunkGraph,
        state: &mut DispatchState,
        task_id: TaskId,
    ) -> Result<()> {
        let done = graph.task_chunks(&task_id).iter().all(|id| {
            graph
                .get_chunk(id)
                .map(|c| c.state.satisfies_dependents())
                .unwrap_or(true)
        });
        if done {
            self.set_task_status(state, task_id, TaskStatus::Completed)
                .await?;
        }
        Ok(())
    }

    /// Move an active task to `status`. Finished tasks keep their status.
    async fn set_task_status(
        &self,
        state: &mut DispatchState,
        task_id: TaskId,
        status: TaskStatus,
    ) -> Result<()> {
        let task = state
            .tasks
            .entry(task_id)
            .or_insert_with(|| TaskRecord::new(task_id));
        if !task.status.is_active() {
            return Ok(());
        }
        task.status = status.clone();
        task.updated_at = Utc::now();
        let task = task.clone();
        clog!("Task {} is now {:?}", task_id, status);
        self.emit(OrchestratorEvent::TaskStatusChanged { task_id, status });
        self.records.save_task(&task).await?;
        Ok(())
    }
}

fn add_edge(graph: &mut ChunkGraph, dep: &ChunkDependency) -> Result<()> {
    graph.add_dependency(&dep.source, &dep.target, dep.dep_type, dep.strength)
}

/// An edge may only point at a chunk that has not been scheduled yet.
fn check_edge_targets(graph: &ChunkGraph, dependencies: &[ChunkDependency]) -> Result<()> {
    for dep in dependencies {
        if let Some(target) = graph.get_chunk(&dep.target) {
            if target.state != ChunkState::Created {
                return Err(Error::Validation(format!(
                    "dependency {} targets chunk {} which is already {}",
                    dep.record_id(),
                    dep.target,
                    target.state.name()
                )));
            }
        }
    }
    Ok(())
}

fn apply_admission(graph: &mut ChunkGraph, admission: &Admission) -> Result<()> {
    for chunk in &admission.chunks {
        graph.add_chunk(chunk.clone())?;
    }
    for dep in &admission.dependencies {
        add_edge(graph, dep)?;
    }
    Ok(())
}

/// Put ready chunks taken off a queue back on the retry queue, due now.
/// `created` chunks need nothing: they are found again next tick.
fn requeue_ready(
    graph: &ChunkGraph,
    state: &mut DispatchState,
    ids: impl IntoIterator<Item = ChunkId>,
    now: DateTime<Utc>,
) {
    for id in ids {
        let ready = graph
            .get_chunk(&id)
            .map(|c| c.state == ChunkState::Ready)
            .unwrap_or(false);
        if ready && !state.is_waiting(&id) {
            state.retries.schedule(id, now);
        }
    }
}

fn release_agent(router: &mut CapabilityRouter, id: &AgentId) {
    if let Err(e) = router.release(id) {
        clog_debug!("release: {}", e);
    }
}
