//! Retry policy for failed processing attempts and store writes.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ChunkId;

/// Default maximum number of retries before a chunk is marked failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Exponential backoff configuration.
///
/// Attempt `n` (1-based) waits `initial_backoff_ms * multiplier^(n-1)`,
/// capped at `max_backoff_ms`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first failed processing attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Total attempts for a store operation failing with a transient error.
    pub store_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            store_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Delay before retrying after failed attempt number `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Whether a chunk that has failed `attempts` times may run again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }
}

/// Chunks waiting out their backoff before being routed again.
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    due: HashMap<ChunkId, DateTime<Utc>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `id` to become routable again at `due`.
    pub fn schedule(&mut self, id: ChunkId, due: DateTime<Utc>) {
        self.due.insert(id, due);
    }

    /// Remove and return every chunk whose backoff has elapsed, earliest first.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<ChunkId> {
        let mut ready: Vec<(DateTime<Utc>, ChunkId)> = self
            .due
            .iter()
            .filter(|(_, &due)| due <= now)
            .map(|(&id, &due)| (due, id))
            .collect();
        ready.sort();
        for (_, id) in &ready {
            self.due.remove(id);
        }
        ready.into_iter().map(|(_, id)| id).collect()
    }

    pub fn remove(&mut self, id: &ChunkId) -> bool {
        self.due.remove(id).is_some()
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.due.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }
}
