// src/testing.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory destination and staging area
//!
//! Used by the integration tests and the throughput bench to run the full
//! pipeline without a database or a bucket. [`MemoryDestination`] decodes
//! every loaded buffer so tests can check that each row index arrived
//! exactly once, and can simulate the server-side pipeline that consumes
//! staged objects from a [`MemoryObjectStore`].

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::StagingArea;
use crate::destination::{Destination, StagedIngestion};
use crate::error::{PushError, Result};
use crate::format::{count_rows, decode_rows};
use crate::storage::{object_key, ObjectStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Object store
// ============================================================================

/// Staging area held in a sorted map keyed by object id
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<i64, Bytes>>,
    deletions: Mutex<Vec<i64>>,
    attempts: AtomicU64,
    puts: AtomicU64,
    fail_puts_after: Option<u64>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uploads after the first `n` fail
    pub fn failing_after(n: u64) -> Self {
        Self {
            fail_puts_after: Some(n),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.objects).is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        lock(&self.objects).contains_key(&id)
    }

    /// Ids passed to `delete`, in call order
    pub fn deletions(&self) -> Vec<i64> {
        lock(&self.deletions).clone()
    }

    /// Successful uploads so far
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Stored objects whose id is not in `skip`, ascending
    fn objects_except(&self, skip: &BTreeSet<i64>) -> Vec<(i64, Bytes)> {
        lock(&self.objects)
            .iter()
            .filter(|(id, _)| !skip.contains(id))
            .map(|(id, body)| (*id, body.clone()))
            .collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, id: i64, body: Bytes) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
        if let Some(limit) = self.fail_puts_after {
            if attempt >= limit {
                return Err(PushError::Storage {
                    operation: "put",
                    key: Some(object_key(id)),
                    message: "injected failure".to_string(),
                });
            }
        }
        // Copy out of the lent buffer, which goes back to the pool
        lock(&self.objects).insert(id, Bytes::copy_from_slice(&body));
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        lock(&self.objects).remove(&id);
        lock(&self.deletions).push(id);
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        lock(&self.objects).clear();
        Ok(())
    }
}

// ============================================================================
// Destination
// ============================================================================

#[derive(Default)]
struct Table {
    ids: HashSet<i64>,
    rows: u64,
    duplicates: u64,
    recreated: u32,
}

#[derive(Default)]
struct Pipeline {
    created: bool,
    consumed: BTreeSet<i64>,
    confirmed: BTreeSet<i64>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

struct Inner {
    table: Mutex<Table>,
    pipeline: Mutex<Pipeline>,
    staging: Mutex<Option<Arc<MemoryObjectStore>>>,
    discard: AtomicBool,
    loads: AtomicU64,
    fail_after: AtomicU64,
    failed: AtomicBool,
    loads_after_failure: AtomicU64,
    pipeline_tick: Mutex<Duration>,
}

impl Inner {
    /// Apply one formatted buffer to the table, all or nothing
    fn ingest(&self, body: &[u8]) -> Result<u64> {
        if self.discard.load(Ordering::Relaxed) {
            let rows = count_rows(body);
            lock(&self.table).rows += rows;
            return Ok(rows);
        }

        let ids = decode_rows(body)
            .map(|row| row.map(|row| row.index))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PushError::statement("LOAD DATA", e))?;

        let mut table = lock(&self.table);
        for id in &ids {
            if !table.ids.insert(*id) {
                table.duplicates += 1;
            }
        }
        table.rows += ids.len() as u64;
        Ok(ids.len() as u64)
    }
}

/// Table plus optional simulated pipeline, all in memory
#[derive(Clone)]
pub struct MemoryDestination {
    inner: Arc<Inner>,
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table::default()),
                pipeline: Mutex::new(Pipeline::default()),
                staging: Mutex::new(None),
                discard: AtomicBool::new(false),
                loads: AtomicU64::new(0),
                fail_after: AtomicU64::new(u64::MAX),
                failed: AtomicBool::new(false),
                loads_after_failure: AtomicU64::new(0),
                pipeline_tick: Mutex::new(Duration::from_millis(5)),
            }),
        }
    }

    /// Count rows without decoding or remembering ids
    pub fn discarding(self) -> Self {
        self.inner.discard.store(true, Ordering::Relaxed);
        self
    }

    /// Loads after the first `n` fail, as does every load after that
    pub fn failing_after(self, n: u64) -> Self {
        self.inner.fail_after.store(n, Ordering::Relaxed);
        self
    }

    /// Staging area the simulated pipeline reads from
    pub fn with_staging(self, store: Arc<MemoryObjectStore>) -> Self {
        *lock(&self.inner.staging) = Some(store);
        self
    }

    /// How often the simulated pipeline picks up new objects
    pub fn with_pipeline_tick(self, tick: Duration) -> Self {
        *lock(&self.inner.pipeline_tick) = tick;
        self
    }

    /// Rows stored, duplicates included
    pub fn rows(&self) -> u64 {
        lock(&self.inner.table).rows
    }

    pub fn distinct_rows(&self) -> usize {
        lock(&self.inner.table).ids.len()
    }

    pub fn duplicate_rows(&self) -> u64 {
        lock(&self.inner.table).duplicates
    }

    /// Whether the stored ids are exactly `0..num_rows`, each once
    pub fn holds_exactly(&self, num_rows: i64) -> bool {
        let table = lock(&self.inner.table);
        table.duplicates == 0
            && table.ids.len() as i64 == num_rows
            && table.ids.iter().all(|id| (0..num_rows).contains(id))
    }

    pub fn times_recreated(&self) -> u32 {
        lock(&self.inner.table).recreated
    }

    /// Successful bulk loads
    pub fn loads(&self) -> u64 {
        self.inner
            .loads
            .load(Ordering::Relaxed)
            .min(self.inner.fail_after.load(Ordering::Relaxed))
    }

    /// Load attempts made after the first injected failure
    pub fn loads_after_failure(&self) -> u64 {
        self.inner.loads_after_failure.load(Ordering::Relaxed)
    }

    pub fn pipeline_exists(&self) -> bool {
        lock(&self.inner.pipeline).created
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn recreate_table(&self) -> Result<()> {
        let mut table = lock(&self.inner.table);
        let recreated = table.recreated + 1;
        *table = Table {
            recreated,
            ..Table::default()
        };
        Ok(())
    }

    async fn row_count(&self) -> Result<u64> {
        Ok(self.rows())
    }

    async fn load_batch(&self, slot: &str, data: Bytes) -> Result<u64> {
        let attempt = self.inner.loads.fetch_add(1, Ordering::Relaxed) + 1;
        if self.inner.failed.load(Ordering::Relaxed) {
            self.inner.loads_after_failure.fetch_add(1, Ordering::Relaxed);
        }
        if attempt > self.inner.fail_after.load(Ordering::Relaxed) {
            self.inner.failed.store(true, Ordering::Relaxed);
            return Err(PushError::statement(
                format!("LOAD DATA LOCAL INFILE '{slot}'"),
                "injected failure",
            ));
        }
        self.inner.ingest(&data)
    }
}

#[async_trait]
impl StagedIngestion for MemoryDestination {
    async fn create_pipeline(&self, staging: &StagingArea) -> Result<()> {
        if lock(&self.inner.staging).is_none() {
            return Err(PushError::statement(
                format!("CREATE PIPELINE FROM '{}'", staging.bucket),
                "no staging area attached",
            ));
        }
        lock(&self.inner.pipeline).created = true;
        Ok(())
    }

    async fn start_pipeline(&self) -> Result<()> {
        let store = lock(&self.inner.staging).clone();
        let mut pipeline = lock(&self.inner.pipeline);
        let (true, Some(store)) = (pipeline.created, store) else {
            return Err(PushError::statement("START PIPELINE", "pipeline does not exist"));
        };
        if pipeline.task.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let tick = *lock(&self.inner.pipeline_tick);
        let task = tokio::spawn(run_pipeline(
            Arc::clone(&self.inner),
            store,
            cancel.clone(),
            tick,
        ));
        pipeline.task = Some((cancel, task));
        Ok(())
    }

    async fn stop_pipeline(&self) -> Result<()> {
        let task = lock(&self.inner.pipeline).task.take();
        if let Some((cancel, task)) = task {
            cancel.cancel();
            task.await
                .map_err(|e| PushError::statement("STOP PIPELINE", e))?;
        }
        Ok(())
    }

    async fn drop_pipeline(&self) -> Result<()> {
        let mut pipeline = lock(&self.inner.pipeline);
        if pipeline.task.is_some() {
            return Err(PushError::statement("DROP PIPELINE", "pipeline is running"));
        }
        pipeline.created = false;
        Ok(())
    }

    async fn confirmed_after(&self, cursor: i64) -> Result<Vec<i64>> {
        let pipeline = lock(&self.inner.pipeline);
        Ok(pipeline
            .confirmed
            .range(cursor.saturating_add(1)..)
            .copied()
            .collect())
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(lock(&self.inner.pipeline).task.is_some())
    }
}

/// Consume every staged object not yet seen, once per tick
async fn run_pipeline(
    inner: Arc<Inner>,
    store: Arc<MemoryObjectStore>,
    cancel: CancellationToken,
    tick: Duration,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(tick) => {}
        }

        let pending = {
            let pipeline = lock(&inner.pipeline);
            store.objects_except(&pipeline.consumed)
        };
        for (id, body) in pending {
            let ingested = inner.ingest(&body);
            let mut pipeline = lock(&inner.pipeline);
            pipeline.consumed.insert(id);
            match ingested {
                Ok(rows) => {
                    pipeline.confirmed.insert(id);
                    tracing::trace!("pipeline consumed object {} ({} rows)", id, rows);
                }
                Err(e) => tracing::warn!("pipeline batch for object {} failed: {}", id, e),
            }
        }
    }
}
