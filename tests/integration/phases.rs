//! Phase gating: held dispatch, queued admission and coherence degradation.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use cadence::agent::Capability;
use cadence::config::Config;
use cadence::core::{Chunk, ChunkDependency, ChunkKind, ChunkState};
use cadence::orchestration::{OrchestratorEvent, Phase, SubmitOutcome, TransitionCause};
use cadence::Error;

use crate::fixtures::{collect_events, test_config, Harness, HangingWorker, RecordingWorker};

/// A cycle long enough that only forced transitions happen during a test.
fn slow_cycle() -> Config {
    let mut config = test_config();
    config.oscillator.cycle_ms = 60_000;
    config
}

/// Test: Consolidation holds dispatch and queues admission
/// Given an orchestrator forced into Consolidation
/// When a chunk is ready and another is submitted
/// Then the first is assigned but not dispatched, the second is queued, and
/// both run once Emission resumes
#[tokio::test]
async fn test_consolidation_holds_dispatch_and_admission() {
    let worker = RecordingWorker::new();
    let mut h = Harness::with_config(&slow_cycle(), worker.clone());
    let mut events = h.orchestrator.subscribe();
    h.agent("n", &[Capability::Note], 2).await;

    let early = Chunk::new(ChunkKind::Note, "early");
    let early_id = early.id;
    assert_eq!(
        h.orchestrator.submit_chunk(early, vec![]).await.unwrap(),
        SubmitOutcome::Admitted
    );

    let transition = h.orchestrator.force_transition().await.unwrap();
    assert_eq!(transition.to, Phase::Consolidation);
    assert_eq!(transition.cause, TransitionCause::Manual);

    let report = h.orchestrator.tick(Utc::now()).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(
        h.orchestrator.get_chunk(&early_id).await.unwrap().state,
        ChunkState::Assigned
    );
    assert!(worker.processed().is_empty());

    let late = Chunk::new(ChunkKind::Note, "late");
    let late_id = late.id;
    assert_eq!(
        h.orchestrator.submit_chunk(late, vec![]).await.unwrap(),
        SubmitOutcome::Queued
    );
    assert!(h.orchestrator.get_chunk(&late_id).await.is_none());

    // Queued submissions are still validated up front.
    let looped = Chunk::new(ChunkKind::Note, "loop");
    let looped_dep = ChunkDependency::blocks(looped.id, looped.id);
    assert!(matches!(
        h.orchestrator.submit_chunk(looped, vec![looped_dep]).await,
        Err(Error::CycleDetected { .. })
    ));

    let status = h.orchestrator.get_phase_status().await;
    assert_eq!(status.phase, Phase::Consolidation);
    assert_eq!(status.integrity_issues, 0);

    h.orchestrator.force_transition().await.unwrap();
    assert!(h.orchestrator.get_chunk(&late_id).await.is_some());

    h.drain().await;
    assert_eq!(worker.processed(), vec!["early", "late"]);

    let phase_changes = collect_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, OrchestratorEvent::PhaseChanged(_)))
        .count();
    assert_eq!(phase_changes, 2);
}

/// Test: Edges wait for Consolidation
/// Given two chunks admitted during Emission with an edge between them
/// When the orchestrator ticks through Emission
/// Then the edge stays pending and its target stays `created` until the next
/// Consolidation applies it, after which the chain runs in order
#[tokio::test]
async fn test_new_edges_apply_at_consolidation() {
    let worker = RecordingWorker::new();
    let h = Harness::with_config(&slow_cycle(), worker.clone());
    h.agent("n", &[Capability::Note], 2).await;

    let first = Chunk::new(ChunkKind::Note, "first");
    let second = Chunk::new(ChunkKind::Note, "second");
    let (i1, i2) = (first.id, second.id);
    h.orchestrator
        .submit_batch(vec![second, first], vec![ChunkDependency::blocks(i1, i2)])
        .await
        .unwrap();

    for _ in 0..10 {
        h.orchestrator.tick(Utc::now()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    assert_eq!(worker.processed(), vec!["first"]);
    assert_eq!(
        h.orchestrator.get_chunk(&i2).await.unwrap().state,
        ChunkState::Created
    );
    assert_eq!(h.orchestrator.snapshot().await.dependencies.len(), 0);
    assert_eq!(h.orchestrator.pending_dependencies().await.len(), 1);
    assert!(!h.orchestrator.is_idle().await);

    let transition = h.orchestrator.force_transition().await.unwrap();
    assert_eq!(transition.to, Phase::Consolidation);
    assert_eq!(h.orchestrator.snapshot().await.dependencies.len(), 1);
    assert!(h.orchestrator.pending_dependencies().await.is_empty());
    assert_eq!(h.orchestrator.get_phase_status().await.integrity_issues, 0);

    h.orchestrator.force_transition().await.unwrap();
    h.drain().await;
    assert_eq!(worker.processed(), vec!["first", "second"]);
}

/// Test: Coherence under persistent timeouts
/// Given a fast oscillator and a worker that never finishes
/// When Emission keeps hitting its ceiling
/// Then coherence falls below the floor, phases shorten, and every
/// transition lands in the coherence log
#[tokio::test]
async fn test_timeouts_degrade_coherence() {
    let mut config = test_config();
    config.oscillator.cycle_ms = 40;
    config.oscillator.organic_reward = 0.0;
    let h = Harness::with_config(&config, Arc::new(HangingWorker));
    h.agent("p", &[Capability::Planning], 1).await;
    h.orchestrator
        .submit_chunk(Chunk::new(ChunkKind::Task, "forever"), vec![])
        .await
        .unwrap();

    let initial = h.orchestrator.get_phase_status().await;
    assert_eq!(initial.target_ms, 30);

    let mut now = Utc::now();
    let mut transitions = Vec::new();
    for _ in 0..5_000 {
        now += ChronoDuration::milliseconds(1);
        let report = h.orchestrator.tick(now).await.unwrap();
        transitions.extend(report.transitions);
        let timeouts = transitions
            .iter()
            .filter(|t| t.cause == TransitionCause::Timeout)
            .count();
        if timeouts >= 20 {
            break;
        }
    }

    let timeouts: Vec<_> = transitions
        .iter()
        .filter(|t| t.cause == TransitionCause::Timeout)
        .collect();
    assert_eq!(timeouts.len(), 20);
    assert!(timeouts.iter().all(|t| t.from == Phase::Emission));

    let status = h.orchestrator.phase_status_at(now).await;
    assert!(status.coherence < 0.3, "coherence {}", status.coherence);
    assert!(status.stabilizing);
    assert_eq!(status.timeout_transitions, 20);
    // The last timeout opened a shortened Consolidation.
    assert_eq!(status.phase, Phase::Consolidation);
    assert!(status.target_ms < 10, "target {}", status.target_ms);

    let log = h.orchestrator.records().coherence_log().await.unwrap();
    assert_eq!(log.len(), transitions.len());
    assert!(log.iter().all(|entry| entry.ratio == "3:1"));
}
