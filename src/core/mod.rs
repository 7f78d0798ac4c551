//! Core domain models for cadence.
//!
//! Chunks are the units of decomposed work; the chunk graph records which
//! chunks must resolve before others may run.

pub mod chunk;
pub mod dag;

pub use chunk::{Chunk, ChunkId, ChunkKind, ChunkState, Metadata, TaskId};
pub use dag::{ChunkDependency, ChunkGraph, DependencyType, GraphSnapshot};
