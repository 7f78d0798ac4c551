//! Dependency ordering, routing and resolution through the orchestrator.

use std::collections::HashMap;

use cadence::agent::{AgentId, Capability};
use cadence::core::{Chunk, ChunkDependency, ChunkId, ChunkKind, ChunkState};
use cadence::orchestration::{OrchestratorEvent, StrategicContext};

use crate::fixtures::{collect_events, Harness, RecordingWorker};

/// Test: Scenario A
/// Given A -> B -> C submitted in the order C, B, A
/// When the orchestrator drains
/// Then the worker sees A, B, C
#[tokio::test]
async fn test_chain_submitted_backwards_runs_forwards() {
    let worker = RecordingWorker::new();
    let h = Harness::new(worker.clone());
    h.agent("planner", &[Capability::Planning], 3).await;

    let c = Chunk::new(ChunkKind::Task, "C");
    let b = Chunk::new(ChunkKind::Task, "B");
    let a = Chunk::new(ChunkKind::Task, "A");
    let (ia, ib, ic) = (a.id, b.id, c.id);

    h.orchestrator.submit_chunk(c, vec![]).await.unwrap();
    h.orchestrator
        .submit_chunk(b, vec![ChunkDependency::blocks(ib, ic)])
        .await
        .unwrap();
    h.orchestrator
        .submit_chunk(a, vec![ChunkDependency::blocks(ia, ib)])
        .await
        .unwrap();

    let report = h.drain().await;

    assert_eq!(worker.processed(), vec!["A", "B", "C"]);
    assert_eq!(report.resolved, vec![ia, ib, ic]);
    for id in [ia, ib, ic] {
        let chunk = h.orchestrator.get_chunk(&id).await.unwrap();
        assert_eq!(chunk.state, ChunkState::Resolved);
    }
}

/// Test: No premature dispatch
/// Given a diamond with a tail and enough agents to run everything at once
/// When the orchestrator drains
/// Then no chunk starts processing before every blocking source resolved
#[tokio::test]
async fn test_no_dispatch_before_sources_resolve() {
    let worker = RecordingWorker::new();
    let mut h = Harness::new(worker.clone());
    let mut events = h.orchestrator.subscribe();
    h.agent("a1", &[Capability::Planning], 4).await;
    h.agent("a2", &[Capability::Planning], 4).await;

    let chunks: Vec<Chunk> = ["root", "left", "right", "join", "tail", "solo"]
        .iter()
        .map(|c| Chunk::new(ChunkKind::Task, *c))
        .collect();
    let ids: Vec<ChunkId> = chunks.iter().map(|c| c.id).collect();
    let edges = vec![
        ChunkDependency::blocks(ids[0], ids[1]),
        ChunkDependency::blocks(ids[0], ids[2]),
        ChunkDependency::blocks(ids[1], ids[3]),
        ChunkDependency::blocks(ids[2], ids[3]),
        ChunkDependency::blocks(ids[3], ids[4]),
    ];
    h.orchestrator
        .submit_batch(chunks, edges.clone())
        .await
        .unwrap();

    h.drain().await;
    assert_eq!(worker.processed().len(), 6);

    let mut resolved_at: HashMap<ChunkId, usize> = HashMap::new();
    let mut started_at: HashMap<ChunkId, usize> = HashMap::new();
    for (i, event) in collect_events(&mut events).into_iter().enumerate() {
        if let OrchestratorEvent::ChunkStateChanged { chunk_id, state } = event {
            match state {
                ChunkState::Processing => {
                    started_at.insert(chunk_id, i);
                }
                ChunkState::Resolved => {
                    resolved_at.insert(chunk_id, i);
                }
                _ => {}
            }
        }
    }
    for edge in &edges {
        assert!(
            resolved_at[&edge.source] < started_at[&edge.target],
            "{} started before {} resolved",
            edge.target,
            edge.source
        );
    }
}

/// Test: Scenario B
/// Given X{research} idle and Y{note} with room for one chunk
/// When a note chunk is routed
/// Then it goes to Y
#[tokio::test]
async fn test_note_chunk_routes_by_capability() {
    let worker = RecordingWorker::new();
    let h = Harness::new(worker.clone());
    h.agent("X", &[Capability::Research], 10).await;
    h.agent("Y", &[Capability::Note], 1).await;

    let note = Chunk::new(ChunkKind::Note, "jot this down");
    let id = note.id;
    h.orchestrator.submit_chunk(note, vec![]).await.unwrap();
    h.drain().await;

    let chunk = h.orchestrator.get_chunk(&id).await.unwrap();
    assert_eq!(chunk.agent_id, Some(AgentId::from("Y")));
    assert_eq!(chunk.state, ChunkState::Resolved);
}

/// Test: Routing never ignores capabilities
/// Given only a note agent
/// When a research chunk and a note chunk are submitted
/// Then the research chunk waits and the note chunk runs
#[tokio::test]
async fn test_unroutable_chunk_waits_for_capable_agent() {
    let worker = RecordingWorker::new();
    let h = Harness::new(worker.clone());
    h.agent("Y", &[Capability::Note], 2).await;

    let research = Chunk::new(ChunkKind::Research, "dig");
    let note = Chunk::new(ChunkKind::Note, "jot");
    let (ir, in_) = (research.id, note.id);
    h.orchestrator
        .submit_batch(vec![research, note], vec![])
        .await
        .unwrap();

    let mut report = h.orchestrator.tick(chrono::Utc::now()).await.unwrap();
    assert_eq!(report.unroutable, vec![ir]);
    for _ in 0..10 {
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        report.merge(h.orchestrator.tick(chrono::Utc::now()).await.unwrap());
    }
    assert_eq!(report.resolved, vec![in_]);
    assert_eq!(
        h.orchestrator.get_chunk(&ir).await.unwrap().state,
        ChunkState::Ready
    );
    assert!(!h.orchestrator.is_idle().await);

    h.agent("R", &[Capability::Research], 1).await;
    h.drain().await;
    let chunk = h.orchestrator.get_chunk(&ir).await.unwrap();
    assert_eq!(chunk.state, ChunkState::Resolved);
    assert_eq!(chunk.agent_id, Some(AgentId::from("R")));
    assert_eq!(worker.processed(), vec!["jot", "dig"]);
}

/// Test: Resolution follows metadata and stays pure
/// Given a chunk offering two actions with explicit priorities
/// When it is scheduled
/// Then the prioritized action is used, a decision record is written, and
/// resolving the same context again gives the same answer
#[tokio::test]
async fn test_resolution_uses_priorities_and_is_recorded() {
    let worker = RecordingWorker::new();
    let h = Harness::new(worker.clone());
    h.agent("p", &[Capability::Planning], 1).await;

    let chunk = Chunk::new(ChunkKind::Task, "outline")
        .with_metadata("actions", serde_json::json!(["skim", "expand"]))
        .with_metadata("priorities", serde_json::json!({"skim": 0.1, "expand": 0.9}));
    let id = chunk.id;
    h.orchestrator.submit_chunk(chunk, vec![]).await.unwrap();
    h.drain().await;

    let resolved = h.orchestrator.get_chunk(&id).await.unwrap();
    assert_eq!(resolved.processed_content.as_deref(), Some("expand:outline"));

    let decisions = h.orchestrator.records().decisions().await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].chunk_id, Some(id));
    assert_eq!(decisions[0].resolution.chosen.action.as_str(), "expand");
    assert_eq!(decisions[0].resolution.scores.len(), 2);

    let resolver = h.orchestrator.resolver().await;
    let context = StrategicContext::for_chunk(&resolved);
    let first = resolver.resolve(&context).unwrap();
    let second = resolver.resolve(&context).unwrap();
    assert_eq!(first, second);
    assert_eq!(resolver.table().len(), 1);
}

/// Test: No edge onto scheduled work
/// Given a research chunk already ready and waiting for a research agent
/// When a new chunk is submitted as its blocking source
/// Then the submission is rejected and the waiting chunk is untouched
#[tokio::test]
async fn test_edge_onto_ready_chunk_is_rejected() {
    let worker = RecordingWorker::new();
    let h = Harness::new(worker.clone());
    h.agent("p", &[Capability::Planning], 1).await;

    let b = Chunk::new(ChunkKind::Research, "B");
    let ib = b.id;
    h.orchestrator.submit_chunk(b, vec![]).await.unwrap();
    let report = h.orchestrator.tick(chrono::Utc::now()).await.unwrap();
    assert_eq!(report.unroutable, vec![ib]);

    let a = Chunk::new(ChunkKind::Task, "A");
    let ia = a.id;
    assert!(matches!(
        h.orchestrator
            .submit_chunk(a, vec![ChunkDependency::blocks(ia, ib)])
            .await,
        Err(cadence::Error::Validation(_))
    ));
    assert!(h.orchestrator.get_chunk(&ia).await.is_none());
    assert!(h.orchestrator.pending_dependencies().await.is_empty());

    h.agent("r", &[Capability::Research], 1).await;
    h.drain().await;
    assert_eq!(worker.processed(), vec!["B"]);
}
