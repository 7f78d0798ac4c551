//! Integration test suite for cadence.
//!
//! These tests drive the orchestrator end to end with in-process workers and
//! check that graph, resolver, router, oscillator and store cooperate.
//!
//! # Test Categories
//!
//! - `scheduling`: dependency ordering, capability routing, resolution
//! - `failures`: retries, terminal failure, cascade cancellation
//! - `phases`: Consolidation gating and coherence under timeouts
//! - `persistence`: restore from the record store, stale writes
//!
//! Workers are plain futures, so nothing here touches the network.

mod fixtures;

mod failures;
mod persistence;
mod phases;
mod scheduling;
