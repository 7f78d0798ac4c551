//! Retry, terminal failure and cancellation.

use cadence::agent::Capability;
use cadence::core::{Chunk, ChunkDependency, ChunkKind, ChunkState, TaskId};
use cadence::orchestration::{TaskStatus, DEFAULT_MAX_RETRIES};
use cadence::Error;

use crate::fixtures::{FlakyWorker, Harness, HangingWorker, RecordingWorker};

/// Test: Transient worker failures are retried
/// Given a worker that fails twice
/// When a chunk is scheduled
/// Then it resolves on the third call with two recorded attempts
#[tokio::test]
async fn test_flaky_worker_recovers() {
    let worker = FlakyWorker::new(2);
    let h = Harness::new(worker.clone());
    h.agent("p", &[Capability::Planning], 1).await;

    let chunk = Chunk::new(ChunkKind::Task, "retry me");
    let id = chunk.id;
    h.orchestrator.submit_chunk(chunk, vec![]).await.unwrap();
    let report = h.drain().await;

    assert_eq!(report.retried, vec![id, id]);
    assert!(report.failed.is_empty());
    let chunk = h.orchestrator.get_chunk(&id).await.unwrap();
    assert_eq!(chunk.state, ChunkState::Resolved);
    assert_eq!(chunk.attempts, 2);
    assert_eq!(chunk.processed_content.as_deref(), Some("RETRY ME"));
    assert_eq!(worker.calls(), 3);
}

/// Test: Exhausted retries are terminal
/// Given a worker that always fails and a task of two chained chunks
/// When the first chunk exhausts its retries
/// Then it is failed, its dependent is never released, the task is failed
/// with the originating error, and the failure is surfaced
#[tokio::test]
async fn test_exhausted_retries_fail_chunk_and_task() {
    let worker = FlakyWorker::always();
    let h = Harness::new(worker.clone());
    h.agent("p", &[Capability::Planning], 2).await;

    let task = TaskId::new();
    let parts = Chunk::decompose(task, ChunkKind::Task, &["first", "second"]);
    let (first, second) = (parts[0].id, parts[1].id);
    h.orchestrator
        .submit_batch(parts, vec![ChunkDependency::blocks(first, second)])
        .await
        .unwrap();

    let report = h.drain().await;

    assert_eq!(worker.calls(), DEFAULT_MAX_RETRIES as usize + 1);
    assert_eq!(report.failed.len(), 1);
    match &report.failed[0] {
        Error::ProcessingFailed {
            chunk_id,
            attempts,
            error,
        } => {
            assert_eq!(*chunk_id, first);
            assert_eq!(*attempts, DEFAULT_MAX_RETRIES + 1);
            assert!(error.contains("flaky failure"));
        }
        other => panic!("Expected ProcessingFailed, got {:?}", other),
    }

    assert!(matches!(
        h.orchestrator.get_chunk(&first).await.unwrap().state,
        ChunkState::Failed { .. }
    ));
    assert_eq!(
        h.orchestrator.get_chunk(&second).await.unwrap().state,
        ChunkState::Created
    );
    match h.orchestrator.task(&task).await.unwrap().status {
        TaskStatus::Failed { error } => assert!(error.contains("flaky failure")),
        other => panic!("Expected failed task, got {:?}", other),
    }
    assert_eq!(h.orchestrator.agents().await[0].current_load, 0);
}

/// Test: Cascade cancellation
/// Given a task whose root chunk is in flight and whose children wait for an agent
/// When the task is cancelled
/// Then every chunk is cancelled, the agent's load is released and the
/// orchestrator goes idle
#[tokio::test]
async fn test_cancel_task_cascades_and_releases_load() {
    let h = Harness::new(std::sync::Arc::new(HangingWorker));
    h.agent("p", &[Capability::Planning], 1).await;

    let task = TaskId::new();
    let root = Chunk::new(ChunkKind::Task, "root").with_task(task);
    let child_a = Chunk::new(ChunkKind::Task, "child a").with_parent(root.id);
    let child_b = Chunk::new(ChunkKind::Task, "child b").with_parent(root.id);
    let ids = [root.id, child_a.id, child_b.id];
    h.orchestrator
        .submit_batch(vec![root, child_a, child_b], vec![])
        .await
        .unwrap();

    let report = h.orchestrator.tick(chrono::Utc::now()).await.unwrap();
    assert_eq!(report.dispatched, vec![ids[0]]);
    assert_eq!(report.unroutable.len(), 2);
    assert_eq!(h.orchestrator.agents().await[0].current_load, 1);

    let cancelled = h.orchestrator.cancel_task(&task).await.unwrap();
    assert_eq!(cancelled.len(), 3);
    for id in ids {
        assert!(matches!(
            h.orchestrator.get_chunk(&id).await.unwrap().state,
            ChunkState::Cancelled { .. }
        ));
    }
    assert_eq!(h.orchestrator.agents().await[0].current_load, 0);
    assert_eq!(
        h.orchestrator.task(&task).await.unwrap().status,
        TaskStatus::Cancelled
    );
    assert!(h.orchestrator.is_idle().await);

    // The interrupted worker must not resurrect the root.
    let report = h.orchestrator.tick(chrono::Utc::now()).await.unwrap();
    assert!(report.resolved.is_empty());
}

/// Test: Cancelling a chunk spares unrelated work
#[tokio::test]
async fn test_cancel_chunk_only_touches_descendants() {
    let h = Harness::new(std::sync::Arc::new(HangingWorker));
    let parent = Chunk::new(ChunkKind::Note, "parent");
    let child = Chunk::new(ChunkKind::Note, "child").with_parent(parent.id);
    let other = Chunk::new(ChunkKind::Note, "other");
    let (ip, ic, io) = (parent.id, child.id, other.id);
    h.orchestrator
        .submit_batch(vec![parent, child, other], vec![])
        .await
        .unwrap();

    let cancelled = h.orchestrator.cancel_chunk(&ip).await.unwrap();
    assert_eq!(cancelled.len(), 2);
    assert!(cancelled.contains(&ic));
    assert_eq!(
        h.orchestrator.get_chunk(&io).await.unwrap().state,
        ChunkState::Created
    );

    h.orchestrator.archive_chunk(&ip).await.unwrap();
    assert_eq!(
        h.orchestrator.get_chunk(&ip).await.unwrap().state,
        ChunkState::Archived { resolved: false }
    );
    assert!(matches!(
        h.orchestrator.archive_chunk(&io).await,
        Err(Error::InvalidStateTransition { .. })
    ));
    assert!(matches!(
        h.orchestrator.cancel_chunk(&cadence::core::ChunkId::new()).await,
        Err(Error::NotFound { .. })
    ));
}

/// Test: Store failures mid-tick strand nothing
/// Given a chunk about to be scheduled and a store that fails every attempt
/// When a tick hits the failure
/// Then the tick errors, and once the store recovers the chunk still runs
#[tokio::test]
async fn test_store_failure_during_tick_keeps_chunk_schedulable() {
    let worker = RecordingWorker::new();
    let h = Harness::new(worker.clone());
    h.agent("p", &[Capability::Planning], 1).await;
    let chunk = Chunk::new(ChunkKind::Task, "survive");
    let id = chunk.id;
    h.orchestrator.submit_chunk(chunk, vec![]).await.unwrap();

    h.store.fail_next(3);
    assert!(h.orchestrator.tick(chrono::Utc::now()).await.is_err());
    assert_eq!(
        h.orchestrator.get_chunk(&id).await.unwrap().state,
        ChunkState::Created
    );

    h.drain().await;
    assert_eq!(worker.processed(), vec!["survive"]);
    assert_eq!(
        h.orchestrator.get_chunk(&id).await.unwrap().state,
        ChunkState::Resolved
    );
}

/// Test: Worker outcomes survive a failed write-back
/// Given two chunks whose workers have already answered
/// When writing back the first outcome fails
/// Then both outcomes are applied on a later tick and agent load returns to zero
#[tokio::test]
async fn test_outcomes_survive_failed_write_back() {
    let worker = RecordingWorker::new();
    let h = Harness::new(worker.clone());
    h.agent("p", &[Capability::Planning], 2).await;
    let a = Chunk::new(ChunkKind::Task, "a");
    let b = Chunk::new(ChunkKind::Task, "b");
    let (ia, ib) = (a.id, b.id);
    h.orchestrator.submit_batch(vec![a, b], vec![]).await.unwrap();

    let report = h.orchestrator.tick(chrono::Utc::now()).await.unwrap();
    assert_eq!(report.dispatched.len(), 2);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    h.store.fail_next(3);
    assert!(h.orchestrator.tick(chrono::Utc::now()).await.is_err());
    assert!(!h.orchestrator.is_idle().await);

    let report = h.drain().await;
    assert_eq!(report.resolved.len(), 2);
    for id in [ia, ib] {
        assert_eq!(
            h.orchestrator.get_chunk(&id).await.unwrap().state,
            ChunkState::Resolved
        );
    }
    assert_eq!(h.orchestrator.agents().await[0].current_load, 0);
}

/// Test: A lagging subscriber never blocks the loop
#[tokio::test]
async fn test_full_event_channel_drops_without_blocking() {
    let mut config = crate::fixtures::test_config();
    config.orchestrator.event_buffer = 1;
    let worker = RecordingWorker::new();
    let mut h = Harness::with_config(&config, worker.clone());
    let _events = h.orchestrator.subscribe();
    h.agent("p", &[Capability::Planning], 2).await;
    h.orchestrator
        .submit_batch(
            vec![
                Chunk::new(ChunkKind::Task, "x"),
                Chunk::new(ChunkKind::Task, "y"),
            ],
            vec![],
        )
        .await
        .unwrap();

    h.drain().await;
    assert_eq!(worker.processed().len(), 2);
    assert!(h.orchestrator.dropped_events() > 0);
}
