//! Persistence through the record store: restore and optimistic concurrency.

use std::sync::Arc;

use tempfile::TempDir;

use cadence::agent::{AgentId, Capability};
use cadence::config::Config;
use cadence::core::{Chunk, ChunkDependency, ChunkKind, ChunkState, TaskId};
use cadence::orchestration::{Orchestrator, RetryPolicy, TaskStatus};
use cadence::store::{FileStore, MemoryStore, RecordStore, Records};
use cadence::Error;

use crate::fixtures::{caps, test_config, RecordingWorker};

fn file_store(dir: &TempDir) -> Arc<dyn RecordStore> {
    Arc::new(FileStore::open(dir.path().join("store")).expect("Failed to open store"))
}

/// Test: Restore after a completed run
/// Given a workload run to completion on a file store
/// When a new orchestrator restores from the same directory
/// Then graph, agents, tasks and phase state come back identical
#[tokio::test]
async fn test_restore_round_trip() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let config = test_config();
    let worker = RecordingWorker::new();

    let task = TaskId::new();
    let first = Chunk::new(ChunkKind::Research, "gather")
        .with_task(task)
        .with_metadata("source", "archive")
        .with_metadata("priorities", serde_json::json!({"process": 0.4}));
    let second = Chunk::new(ChunkKind::Analysis, "weigh").with_task(task);
    let edges = vec![ChunkDependency::blocks(first.id, second.id)];

    let (snapshot, phase, agents) = {
        let orchestrator = Orchestrator::new(&config, file_store(&dir), worker.clone()).unwrap();
        orchestrator
            .register_agent(AgentId::from("r"), caps(&[Capability::Research]), 1)
            .await
            .unwrap();
        orchestrator
            .register_agent(AgentId::from("a"), caps(&[Capability::Analysis]), 1)
            .await
            .unwrap();
        orchestrator
            .submit_batch(vec![first, second], edges)
            .await
            .unwrap();
        orchestrator
            .run_until_idle(std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            orchestrator.task(&task).await.unwrap().status,
            TaskStatus::Completed
        );
        (
            orchestrator.snapshot().await,
            orchestrator.get_phase_status().await,
            orchestrator.agents().await,
        )
    };

    let restored = Orchestrator::restore(&config, file_store(&dir), worker.clone())
        .await
        .unwrap();
    assert_eq!(restored.snapshot().await, snapshot);
    // Registrations come back in store order, not registration order.
    let by_id = |mut list: Vec<cadence::agent::AgentRegistration>| {
        list.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        list
    };
    assert_eq!(by_id(restored.agents().await), by_id(agents));
    assert_eq!(
        restored.task(&task).await.unwrap().status,
        TaskStatus::Completed
    );
    let status = restored.get_phase_status().await;
    assert_eq!(status.phase, phase.phase);
    assert_eq!(status.cycle_count, phase.cycle_count);
    assert_eq!(status.coherence, phase.coherence);

    let gathered = snapshot
        .chunks
        .iter()
        .find(|c| c.content() == "gather")
        .unwrap();
    assert_eq!(gathered.metadata_str("source"), Some("archive"));
    assert_eq!(gathered.state, ChunkState::Resolved);
    assert!(restored.is_idle().await);
}

/// Test: Restore resets interrupted work
/// Given a chunk persisted mid-dispatch
/// When the orchestrator restores
/// Then the chunk is back in `created` and runs again
#[tokio::test]
async fn test_restore_requeues_interrupted_chunk() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let config = test_config();
    let store = file_store(&dir);

    let mut chunk = Chunk::new(ChunkKind::Note, "half done");
    chunk.transition(ChunkState::Ready).unwrap();
    chunk.assign(AgentId::from("gone")).unwrap();
    chunk.transition(ChunkState::Processing).unwrap();
    let id = chunk.id;
    Records::new(store.clone(), RetryPolicy::default())
        .save_chunk(&chunk)
        .await
        .unwrap();

    let worker = RecordingWorker::new();
    let restored = Orchestrator::restore(&config, store, worker.clone())
        .await
        .unwrap();
    let reloaded = restored.get_chunk(&id).await.unwrap();
    assert_eq!(reloaded.state, ChunkState::Created);
    assert_eq!(reloaded.agent_id, None);

    restored
        .register_agent(AgentId::from("n"), caps(&[Capability::Note]), 1)
        .await
        .unwrap();
    restored
        .run_until_idle(std::time::Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(worker.processed(), vec!["half done"]);
}

/// Test: Stale writes are rejected
/// Given two writers over one store that both read version 1
/// When both write
/// Then the second write fails with ConcurrentModification and is not retried
#[tokio::test]
async fn test_stale_writer_gets_concurrent_modification() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let policy = Config::default().retry;
    let first = Records::new(store.clone(), policy.clone());
    let second = Records::new(store.clone(), policy);

    let mut chunk = Chunk::new(ChunkKind::Data, "rows");
    assert_eq!(first.save_chunk(&chunk).await.unwrap(), 1);
    assert!(second.load_chunk(&chunk.id).await.unwrap().is_some());

    chunk.transition(ChunkState::Ready).unwrap();
    assert_eq!(first.save_chunk(&chunk).await.unwrap(), 2);

    chunk.transition(ChunkState::Cancelled {
        reason: "stale".to_string(),
    })
    .unwrap();
    match second.save_chunk(&chunk).await {
        Err(Error::ConcurrentModification {
            expected, actual, ..
        }) => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("Expected ConcurrentModification, got {:?}", other),
    }

    let stored: Chunk = first
        .get(cadence::store::RecordKind::Chunk, &chunk.id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, ChunkState::Ready);
}
