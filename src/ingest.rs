// src/ingest.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ingestion workers: drain the ready queue into the destination
//!
//! Two interchangeable transports share one worker loop. A transport error
//! is recorded in the run state, which cancels every other worker; nothing
//! is retried.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::destination::Destination;
use crate::error::{PushError, Result};
use crate::format::payload_bytes;
use crate::pool::IngestSide;
use crate::state::RunState;
use crate::storage::ObjectStore;

/// Where a filled buffer goes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Deliver one batch. Returns a label for logs (slot or object key).
    async fn deliver(&self, slot: usize, rows: u64, data: Bytes) -> Result<String>;
}

/// Streams each buffer through a bulk-load statement
pub struct DirectTransport {
    destination: Arc<dyn Destination>,
}

impl DirectTransport {
    pub fn new(destination: Arc<dyn Destination>) -> Self {
        Self { destination }
    }
}

/// Name under which a worker slot's in-memory source is registered
pub fn slot_name(slot: usize) -> String {
    format!("slot-{slot}")
}

#[async_trait]
impl Transport for DirectTransport {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn deliver(&self, slot: usize, rows: u64, data: Bytes) -> Result<String> {
        let name = slot_name(slot);
        let bytes = data.len();
        let loaded = self
            .destination
            .load_batch(&name, data)
            .await
            .map_err(|e| PushError::Transport {
                slot: name.clone(),
                rows,
                bytes,
                source: Box::new(e),
            })?;
        if loaded != rows {
            tracing::warn!(
                "{}: destination reported {} rows for a {} row batch",
                name,
                loaded,
                rows
            );
        }
        Ok(name)
    }
}

/// Uploads each buffer as one staged object
pub struct StagedTransport {
    store: Arc<dyn ObjectStore>,
    state: Arc<RunState>,
}

impl StagedTransport {
    pub fn new(store: Arc<dyn ObjectStore>, state: Arc<RunState>) -> Self {
        Self { store, state }
    }

    /// Confirm the staging area is reachable, then empty it
    pub async fn prepare(&self) -> Result<()> {
        self.store.head().await?;
        self.store.delete_all().await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for StagedTransport {
    fn name(&self) -> &'static str {
        "staged"
    }

    async fn deliver(&self, slot: usize, rows: u64, data: Bytes) -> Result<String> {
        let id = self.state.next_object_id();
        let bytes = data.len();
        self.store
            .put(id, data)
            .await
            .map_err(|e| PushError::Transport {
                slot: slot_name(slot),
                rows,
                bytes,
                source: Box::new(e),
            })?;
        Ok(crate::storage::object_key(id))
    }
}

/// Spawn `workers` ingestion workers onto a join set
pub fn spawn_ingesters(
    workers: usize,
    transport: Arc<dyn Transport>,
    queues: IngestSide,
    state: Arc<RunState>,
    payload_size: usize,
) -> JoinSet<()> {
    let workers = workers.max(1);
    tracing::info!(
        "Starting {} {} ingestion workers",
        workers,
        transport.name()
    );

    let mut set = JoinSet::new();
    for slot in 0..workers {
        set.spawn(run_worker(
            slot,
            Arc::clone(&transport),
            queues.clone(),
            Arc::clone(&state),
            payload_size,
        ));
    }
    set
}

/// Wait for every ingestion worker. A panicked worker fails the run.
pub async fn join_ingesters(mut set: JoinSet<()>, state: &RunState) {
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            state.fail(PushError::Invariant(format!(
                "ingestion worker panicked: {e}"
            )));
        }
    }
}

async fn run_worker(
    slot: usize,
    transport: Arc<dyn Transport>,
    queues: IngestSide,
    state: Arc<RunState>,
    payload_size: usize,
) {
    let mut delivered = 0u64;
    loop {
        let batch = tokio::select! {
            biased;
            _ = state.cancelled() => {
                tracing::debug!("slot-{}: cancelled after {} batches", slot, delivered);
                return;
            }
            batch = queues.next_batch() => batch,
        };
        let Some(mut batch) = batch else {
            break;
        };
        if state.is_cancelled() {
            return;
        }

        let data = batch.buffer.lend();
        let bytes = data.len();
        match transport.deliver(slot, batch.rows, data.clone()).await {
            Ok(label) => {
                tracing::debug!(
                    "slot-{}: delivered {} rows ({} bytes) as {}",
                    slot,
                    batch.rows,
                    bytes,
                    label
                );
            }
            Err(e) => {
                state.fail(e);
                return;
            }
        }

        batch.buffer.restore(data);
        state.record_loaded(batch.rows, payload_bytes(batch.rows, payload_size));
        queues.recycle(batch.buffer).await;
        delivered += 1;
    }
    tracing::debug!("slot-{}: ready queue closed after {} batches", slot, delivered);
}
