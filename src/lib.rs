// src/lib.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Memory-bounded synthetic row generation and bulk ingestion
//!
//! This library provides:
//! - Lock-free row-range claiming over a single atomic counter
//! - A fixed pool of reusable buffers cycling between two bounded queues
//! - Xoshiro256++ payload generation on a dedicated rayon pool
//! - Direct (`LOAD DATA LOCAL INFILE`) and staged (S3 + pipeline) transports
//! - A completion tracker that deletes staged objects once confirmed

// Core modules
pub mod constants;
pub mod error;
pub mod format;
pub mod generator;
pub mod pool;
pub mod state;

// Transports and adapters
pub mod destination;
pub mod ingest;
pub mod storage;
pub mod tracker;

// Run control
pub mod config;
pub mod progress;
pub mod runner;

// In-memory adapters for tests and benches
pub mod testing;

// Re-export main API
pub use config::{Args, PipelineConfig, RunConfig, StagingArea};
pub use error::{PushError, Result};
pub use generator::{spawn_generators, GeneratorConfig};
pub use pool::BufferPool;
pub use runner::{run, RunReport, Target};
pub use state::RunState;
