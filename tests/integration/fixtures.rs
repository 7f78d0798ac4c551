//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Orchestrators over an in-memory store with fast retry settings
//! - Workers that record, fail on demand, or never finish
//! - Capability sets and event collection

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

use cadence::agent::{AgentId, Capability, Worker};
use cadence::config::Config;
use cadence::core::Chunk;
use cadence::orchestration::{Orchestrator, OrchestratorEvent, TacticalAction};
use cadence::store::{MemoryStore, RecordStore};
use cadence::{Error, Result};

/// Config tuned for tests: immediate retries, short ticks.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry.initial_backoff_ms = 0;
    config.retry.max_backoff_ms = 0;
    config.orchestrator.tick_ms = 2;
    // Short cycles so deferred edges land within a drain.
    config.oscillator.cycle_ms = 200;
    config
}

pub fn caps(list: &[Capability]) -> BTreeSet<Capability> {
    list.iter().copied().collect()
}

/// Worker that records the content of every chunk it processes, in order.
#[derive(Default)]
pub struct RecordingWorker {
    processed: Mutex<Vec<String>>,
}

impl RecordingWorker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn processed(&self) -> Vec<String> {
        self.processed.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl Worker for RecordingWorker {
    fn process(&self, chunk: Chunk, action: TacticalAction) -> BoxFuture<'static, Result<String>> {
        if let Ok(mut processed) = self.processed.lock() {
            processed.push(chunk.content().to_string());
        }
        async move { Ok(format!("{}:{}", action.action, chunk.content())) }.boxed()
    }
}

/// Worker that fails the first `failures` calls and succeeds afterwards.
pub struct FlakyWorker {
    remaining: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyWorker {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        })
    }

    /// A worker that never succeeds.
    pub fn always() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Worker for FlakyWorker {
    fn process(&self, chunk: Chunk, _action: TacticalAction) -> BoxFuture<'static, Result<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        async move {
            if fail {
                Err(Error::Worker(format!("flaky failure on {}", chunk.content())))
            } else {
                Ok(chunk.content().to_uppercase())
            }
        }
        .boxed()
    }
}

/// Worker whose calls never complete.
pub struct HangingWorker;

impl Worker for HangingWorker {
    fn process(&self, _chunk: Chunk, _action: TacticalAction) -> BoxFuture<'static, Result<String>> {
        futures::future::pending().boxed()
    }
}

/// An orchestrator plus handles to its store.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub fn new(worker: Arc<dyn Worker>) -> Self {
        Self::with_config(&test_config(), worker)
    }

    pub fn with_config(config: &Config, worker: Arc<dyn Worker>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn RecordStore> = store.clone();
        let orchestrator =
            Orchestrator::new(config, dyn_store, worker).expect("Failed to build orchestrator");
        Self {
            orchestrator,
            store,
        }
    }

    pub async fn agent(&self, id: &str, capabilities: &[Capability], max_concurrent: usize) {
        self.orchestrator
            .register_agent(AgentId::from(id), caps(capabilities), max_concurrent)
            .await
            .expect("Failed to register agent");
    }

    /// Tick until idle, failing the test after five seconds.
    pub async fn drain(&self) -> cadence::orchestration::TickReport {
        self.orchestrator
            .run_until_idle(Duration::from_secs(5))
            .await
            .expect("Orchestrator did not go idle")
    }
}

/// Everything currently buffered on an event channel.
pub fn collect_events(rx: &mut mpsc::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
