// src/pool.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed set of reusable buffers circulating between two bounded queues
//!
//! ```text
//!   recycle ──► generators ──► ready ──► ingesters ──┐
//!      ▲                                             │
//!      └─────────────────────────────────────────────┘
//! ```
//!
//! Ownership moves only by queue hand-off. Generators block on an empty
//! recycle queue, which is the only throttle in the pipeline. The ready queue
//! closes when every generator has dropped its sender.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// A reusable byte buffer. `id` identifies the buffer for its whole life.
#[derive(Debug)]
pub struct Buffer {
    id: usize,
    data: Vec<u8>,
}

impl Buffer {
    pub fn with_capacity(id: usize, capacity: usize) -> Self {
        Self {
            id,
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Clear contents, keeping the allocation
    pub fn reset(&mut self) {
        self.data.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Write target for the row formatter
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Lend the contents to a transport without copying.
    /// Pair with [`Buffer::restore`] once the transport has let go.
    pub fn lend(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.data))
    }

    /// Take the allocation back. Copies only if the transport still holds a clone.
    pub fn restore(&mut self, bytes: Bytes) {
        self.data = Vec::from(bytes);
    }
}

/// Rows formatted into one buffer, in transit from a generator to an ingester
#[derive(Debug)]
pub struct RowBatch {
    pub rows: u64,
    pub buffer: Buffer,
}

type Shared<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// The two queues, pre-populated with `num_buffers` empty buffers
pub struct BufferPool {
    num_buffers: usize,
    buffer_capacity: usize,
    recycle_tx: mpsc::Sender<Buffer>,
    recycle_rx: mpsc::Receiver<Buffer>,
    ready_tx: mpsc::Sender<RowBatch>,
    ready_rx: mpsc::Receiver<RowBatch>,
}

impl BufferPool {
    pub fn new(num_buffers: usize, buffer_capacity: usize) -> Self {
        let num_buffers = num_buffers.max(1);
        let (recycle_tx, recycle_rx) = mpsc::channel(num_buffers);
        let (ready_tx, ready_rx) = mpsc::channel(num_buffers);

        for id in 0..num_buffers {
            // Capacity equals the buffer count, so this never fills up
            let _ = recycle_tx.try_send(Buffer::with_capacity(id, buffer_capacity));
        }

        tracing::debug!(
            "BufferPool: {} buffers x {} bytes = {} bytes",
            num_buffers,
            buffer_capacity,
            num_buffers * buffer_capacity
        );

        Self {
            num_buffers,
            buffer_capacity,
            recycle_tx,
            recycle_rx,
            ready_tx,
            ready_rx,
        }
    }

    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Hand each side its queue ends. The pool keeps nothing, so the ready
    /// queue closes as soon as the generator side is gone.
    pub fn split(self) -> (GeneratorSide, IngestSide) {
        let generator = GeneratorSide {
            recycle: Arc::new(Mutex::new(self.recycle_rx)),
            ready: self.ready_tx,
        };
        let ingest = IngestSide {
            ready: Arc::new(Mutex::new(self.ready_rx)),
            recycle: self.recycle_tx,
        };
        (generator, ingest)
    }
}

/// Queue ends used by generator workers (blocking, run on worker threads)
#[derive(Clone)]
pub struct GeneratorSide {
    recycle: Shared<Buffer>,
    ready: mpsc::Sender<RowBatch>,
}

impl GeneratorSide {
    /// Block until a buffer is free. `None` once every ingester is gone.
    pub fn acquire(&self) -> Option<Buffer> {
        self.recycle.blocking_lock().blocking_recv()
    }

    /// Block until the ready queue has room. Gives the batch back if nobody
    /// is left to ingest it.
    pub fn submit(&self, batch: RowBatch) -> Result<(), RowBatch> {
        self.ready.blocking_send(batch).map_err(|e| e.0)
    }
}

/// Queue ends used by ingestion workers (async)
#[derive(Clone)]
pub struct IngestSide {
    ready: Shared<RowBatch>,
    recycle: mpsc::Sender<Buffer>,
}

impl IngestSide {
    /// Wait for the next batch. `None` only once the ready queue is closed and drained.
    pub async fn next_batch(&self) -> Option<RowBatch> {
        self.ready.lock().await.recv().await
    }

    /// Return a buffer. Dropped silently if the generators have all exited.
    pub async fn recycle(&self, mut buffer: Buffer) {
        buffer.reset();
        let _ = self.recycle.send(buffer).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_prepopulates_recycle_queue() {
        let pool = BufferPool::new(4, 128);
        let (generator, ingest) = pool.split();
        let mut ids: Vec<_> = (0..4)
            .map(|_| generator.acquire().expect("buffer"))
            .map(|b| {
                assert!(b.capacity() >= 128);
                assert!(b.is_empty());
                b.id()
            })
            .collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        drop(ingest);
        // With every ingester gone and the queue drained, acquire reports closure
        assert!(generator.acquire().is_none());
    }

    #[test]
    fn test_lend_and_restore_keep_contents() {
        let mut buffer = Buffer::with_capacity(0, 64);
        buffer.as_mut_vec().extend_from_slice(b"0\tabc\n");
        let lent = buffer.lend();
        assert!(buffer.is_empty());
        assert_eq!(&lent[..], b"0\tabc\n");
        buffer.restore(lent);
        assert_eq!(buffer.as_slice(), b"0\tabc\n");
        buffer.reset();
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_ready_queue_closes_when_generators_drop() {
        let pool = BufferPool::new(2, 16);
        let (generator, ingest) = pool.split();

        let worker = tokio::task::spawn_blocking(move || {
            let buffer = generator.acquire().expect("buffer");
            generator
                .submit(RowBatch { rows: 1, buffer })
                .expect("ingester alive");
        });
        worker.await.unwrap();

        let batch = ingest.next_batch().await.expect("one batch");
        assert_eq!(batch.rows, 1);
        assert!(ingest.next_batch().await.is_none());
    }
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_buffers_are_exclusive_and_conserved() {
        use std::collections::HashSet;
        use std::sync::Mutex as StdMutex;

        const BUFFERS: usize = 3;
        const BATCHES_PER_PRODUCER: usize = 200;

        let pool = BufferPool::new(BUFFERS, 32);
        let (generator, ingest) = pool.split();
        // Ids of buffers currently held by a worker rather than a queue
        let held = Arc::new(StdMutex::new(HashSet::new()));

        let producers: Vec<_> = (0..3)
            .map(|_| {
                let generator = generator.clone();
                let held = Arc::clone(&held);
                tokio::task::spawn_blocking(move || {
                    for _ in 0..BATCHES_PER_PRODUCER {
                        let buffer = generator.acquire().expect("buffer");
                        assert!(held.lock().unwrap().insert(buffer.id()), "buffer held twice");
                        assert!(held.lock().unwrap().remove(&buffer.id()));
                        generator
                            .submit(RowBatch { rows: 1, buffer })
                            .expect("ingesters alive");
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let ingest = ingest.clone();
                let held = Arc::clone(&held);
                tokio::spawn(async move {
                    let mut received = 0;
                    while let Some(batch) = ingest.next_batch().await {
                        let id = batch.buffer.id();
                        assert!(held.lock().unwrap().insert(id), "buffer held twice");
                        tokio::task::yield_now().await;
                        assert!(held.lock().unwrap().remove(&id));
                        ingest.recycle(batch.buffer).await;
                        received += 1;
                    }
                    received
                })
            })
            .collect();

        for producer in producers {
            producer.await.unwrap();
        }
        // Keep one recycle receiver to count buffers after the run
        let recycle = Arc::clone(&generator.recycle);
        drop(generator);

        let mut received = 0;
        for consumer in consumers {
            received += consumer.await.unwrap();
        }
        assert_eq!(received, 3 * BATCHES_PER_PRODUCER);
        assert!(held.lock().unwrap().is_empty());

        drop(ingest);
        let mut recycle = recycle.lock().await;
        let mut ids = Vec::new();
        while let Some(buffer) = recycle.recv().await {
            ids.push(buffer.id());
        }
        ids.sort();
        assert_eq!(ids, (0..BUFFERS).collect::<Vec<_>>());
    }
}
