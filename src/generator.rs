// src/generator.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Generator workers: claim row ranges, format them into pooled buffers,
//! hand the buffers to the ready queue
//!
//! Workers run on a dedicated rayon pool because they block on the pool
//! queues. Each worker owns its own Xoshiro256++ stream, so no RNG state is
//! shared between threads.

use rand::RngCore;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

use crate::error::{PushError, Result};
use crate::format::{estimated_row_size, RowFormatter};
use crate::pool::{GeneratorSide, RowBatch};
use crate::state::{Claim, RunState};

/// Configuration for the generator side of a run
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Random payload bytes per row
    pub payload_size: usize,
    /// Rows per claimed batch (one batch fills one buffer)
    pub batch_size: i64,
    /// Number of generator workers
    pub workers: usize,
    /// Base seed for payloads (None = time + urandom)
    /// Worker `i` seeds its stream with `seed + i`
    pub seed: Option<u64>,
}

impl GeneratorConfig {
    /// Rows per batch so that a buffer of `buffer_capacity` bytes holds a whole batch
    pub fn batch_size_for(buffer_capacity: usize, payload_size: usize) -> i64 {
        ((buffer_capacity / estimated_row_size(payload_size)).max(1)) as i64
    }
}

/// Running generator pool. Joins once every worker has exited, which is
/// also when the ready queue closes.
pub struct GeneratorHandle {
    join: JoinHandle<()>,
    workers: usize,
}

impl GeneratorHandle {
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn join(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| PushError::Invariant(format!("generator pool panicked: {e}")))
    }
}

/// Start `config.workers` generator workers on their own thread pool
pub fn spawn_generators(
    config: GeneratorConfig,
    queues: GeneratorSide,
    state: Arc<RunState>,
) -> Result<GeneratorHandle> {
    let workers = config.workers.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("generator-{i}"))
        .build()
        .map_err(|e| PushError::WorkerPool {
            role: "generator",
            message: e.to_string(),
        })?;

    let seed_base = config.seed.unwrap_or_else(generate_call_entropy);

    tracing::info!(
        "Starting {} generator workers: batch_size={}, payload_size={}",
        workers,
        config.batch_size,
        config.payload_size
    );

    let join = tokio::task::spawn_blocking(move || {
        pool.scope(|scope| {
            for index in 0..workers {
                let queues = queues.clone();
                let state = Arc::clone(&state);
                let config = &config;
                scope.spawn(move |_| {
                    run_worker(
                        index,
                        config,
                        seed_base.wrapping_add(index as u64),
                        &queues,
                        &state,
                    )
                });
            }
            // The outer handle goes away here; the clones die with their workers
            drop(queues);
        });
        tracing::info!(
            "All generator workers finished: {} rows in {} batches",
            state.generated_rows(),
            state.generated_batches()
        );
    });

    Ok(GeneratorHandle { join, workers })
}

/// One worker's loop. Returns when its claim was the final one, when the
/// rows are exhausted, or when the run is cancelled.
fn run_worker(
    index: usize,
    config: &GeneratorConfig,
    seed: u64,
    queues: &GeneratorSide,
    state: &RunState,
) {
    let mut formatter = RowFormatter::new(config.payload_size, seed);
    let mut batches = 0u64;

    loop {
        if state.is_cancelled() {
            tracing::debug!("generator-{}: cancelled after {} batches", index, batches);
            return;
        }

        let (range, last) = match state.claim(config.batch_size) {
            Claim::Full(range) => (range, false),
            Claim::Final(range) => (range, true),
            Claim::Exhausted => break,
        };

        let Some(mut buffer) = queues.acquire() else {
            tracing::debug!("generator-{}: recycle queue closed", index);
            return;
        };
        buffer.reset();
        formatter.fill(buffer.as_mut_vec(), range.start, range.count);

        tracing::trace!(
            "generator-{}: rows [{}, {}) -> buffer {} ({} bytes)",
            index,
            range.start,
            range.end(),
            buffer.id(),
            buffer.len()
        );

        let rows = range.count as u64;
        if queues.submit(RowBatch { rows, buffer }).is_err() {
            tracing::debug!("generator-{}: ready queue closed", index);
            return;
        }
        state.record_generated(rows);
        batches += 1;

        if last {
            break;
        }
    }

    tracing::debug!("generator-{}: done after {} batches", index, batches);
}

/// Generate per-run entropy from time + urandom
fn generate_call_entropy() -> u64 {
    let time_entropy = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    let urandom_entropy: u64 = {
        let mut rng = rand::rng();
        rng.next_u64()
    };

    time_entropy.wrapping_add(urandom_entropy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{decode_rows, write_row};
    use crate::pool::{Buffer, BufferPool};

    fn init_tracing() {
        use tracing_subscriber::{fmt, EnvFilter};
        let _ = fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    }

    #[test]
    fn test_batch_size_for() {
        // 38 digits + 2 * 16 payload + 3 overhead = 73 bytes per row
        assert_eq!(GeneratorConfig::batch_size_for(73 * 100, 16), 100);
        assert_eq!(GeneratorConfig::batch_size_for(73 * 100 + 72, 16), 100);
        // Never zero, even if one row does not fit
        assert_eq!(GeneratorConfig::batch_size_for(10, 1024), 1);
    }

    #[test]
    fn test_full_batch_never_grows_buffer() {
        let capacity = 4 * 1024 * 1024;
        let payload_size = 4096;
        let batch = GeneratorConfig::batch_size_for(capacity, payload_size);
        let first = i64::MAX - batch;

        let mut buffer = Buffer::with_capacity(0, capacity);
        let before = buffer.capacity();
        RowFormatter::new(payload_size, 11).fill(buffer.as_mut_vec(), first, batch);
        assert!(buffer.len() <= capacity);
        assert_eq!(buffer.capacity(), before);

        // Payload made only of bytes that need escaping
        buffer.reset();
        let payload = vec![b'\n'; payload_size];
        for row_index in first..first + batch {
            write_row(buffer.as_mut_vec(), row_index, &payload);
        }
        assert!(buffer.len() <= capacity);
        assert_eq!(buffer.capacity(), before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_generators_cover_every_row_once() {
        init_tracing();

        let num_rows = 10_007;
        let pool = BufferPool::new(3, 4096);
        let (generator_side, ingest) = pool.split();
        let state = Arc::new(RunState::new(num_rows));
        let config = GeneratorConfig {
            payload_size: 8,
            batch_size: GeneratorConfig::batch_size_for(4096, 8),
            workers: 4,
            seed: Some(1),
        };

        let handle = spawn_generators(config, generator_side, Arc::clone(&state)).unwrap();
        assert_eq!(handle.workers(), 4);

        let mut seen = vec![false; num_rows as usize];
        let mut batches = 0;
        while let Some(mut batch) = ingest.next_batch().await {
            let mut rows = 0;
            for row in decode_rows(batch.buffer.as_slice()) {
                let row = row.unwrap();
                assert_eq!(row.payload.len(), 8);
                assert!(!seen[row.index as usize], "row {} twice", row.index);
                seen[row.index as usize] = true;
                rows += 1;
            }
            assert_eq!(rows, batch.rows);
            batches += 1;
            batch.buffer.reset();
            ingest.recycle(batch.buffer).await;
        }
        handle.join().await.unwrap();

        assert!(seen.iter().all(|&s| s));
        assert_eq!(state.generated_rows(), num_rows as u64);
        assert_eq!(state.generated_batches(), batches);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_generators_stop_when_cancelled() {
        init_tracing();

        let pool = BufferPool::new(2, 1024);
        let (generator_side, ingest) = pool.split();
        let state = Arc::new(RunState::new(1_000_000_000));
        let config = GeneratorConfig {
            payload_size: 4,
            batch_size: 16,
            workers: 3,
            seed: None,
        };
        let handle = spawn_generators(config, generator_side, Arc::clone(&state)).unwrap();

        // Take one batch, then cancel and walk away from the queues
        let first = ingest.next_batch().await.expect("first batch");
        assert_eq!(first.rows, 16);
        state.fail(PushError::Invariant("test abort".to_string()));
        drop(first);
        drop(ingest);

        handle.join().await.unwrap();
        assert!(state.generated_rows() < 1_000_000_000);
    }
}
