// src/state.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared run state handed to every worker at spawn time
//!
//! Holds the atomic counters, the cancellation token broadcast to all
//! workers, and the slot for the first fatal error.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::PushError;

/// A contiguous range of row indices owned by one generator batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRange {
    pub start: i64,
    pub count: i64,
}

impl RowRange {
    pub fn end(&self) -> i64 {
        self.start + self.count
    }
}

/// Result of one claim against the shared `remaining` counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// A full batch; keep claiming afterwards
    Full(RowRange),
    /// The batch straddling zero; the claiming worker stops after it
    Final(RowRange),
    /// Nothing left
    Exhausted,
}

/// Turn the post-decrement value of `remaining` into a claim
pub fn claim_from(after: i64, batch_size: i64) -> Claim {
    if after >= 0 {
        Claim::Full(RowRange {
            start: after,
            count: batch_size,
        })
    } else if after > -batch_size {
        Claim::Final(RowRange {
            start: 0,
            count: batch_size + after,
        })
    } else {
        Claim::Exhausted
    }
}

pub struct RunState {
    num_rows: i64,
    remaining: AtomicI64,
    generated_rows: AtomicU64,
    generated_batches: AtomicU64,
    loaded_rows: AtomicU64,
    loaded_bytes: AtomicU64,
    next_object_id: AtomicI64,
    cancel: CancellationToken,
    failure: Mutex<Option<PushError>>,
}

impl RunState {
    pub fn new(num_rows: i64) -> Self {
        Self {
            num_rows,
            remaining: AtomicI64::new(num_rows),
            generated_rows: AtomicU64::new(0),
            generated_batches: AtomicU64::new(0),
            loaded_rows: AtomicU64::new(0),
            loaded_bytes: AtomicU64::new(0),
            next_object_id: AtomicI64::new(0),
            cancel: CancellationToken::new(),
            failure: Mutex::new(None),
        }
    }

    pub fn num_rows(&self) -> i64 {
        self.num_rows
    }

    /// Claim the next batch of rows. One fetch-and-subtract, no other coordination.
    pub fn claim(&self, batch_size: i64) -> Claim {
        let after = self.remaining.fetch_sub(batch_size, Ordering::Relaxed) - batch_size;
        let claim = claim_from(after, batch_size);
        tracing::trace!("claim: remaining_after={}, claim={:?}", after, claim);
        claim
    }

    pub fn record_generated(&self, rows: u64) {
        self.generated_rows.fetch_add(rows, Ordering::Relaxed);
        self.generated_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generated_rows(&self) -> u64 {
        self.generated_rows.load(Ordering::Relaxed)
    }

    pub fn generated_batches(&self) -> u64 {
        self.generated_batches.load(Ordering::Relaxed)
    }

    pub fn record_loaded(&self, rows: u64, bytes: u64) {
        self.loaded_rows.fetch_add(rows, Ordering::Relaxed);
        self.loaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn loaded_rows(&self) -> u64 {
        self.loaded_rows.load(Ordering::Relaxed)
    }

    pub fn loaded_bytes(&self) -> u64 {
        self.loaded_bytes.load(Ordering::Relaxed)
    }

    /// Next staged object id; the first call returns 1
    pub fn next_object_id(&self) -> i64 {
        self.next_object_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Highest staged object id handed out so far
    pub fn last_object_id(&self) -> i64 {
        self.next_object_id.load(Ordering::Relaxed)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Record a fatal error and broadcast cancellation. Only the first error is kept.
    pub fn fail(&self, err: PushError) {
        tracing::error!("aborting run: {}", err);
        if let Ok(mut slot) = self.failure.lock() {
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.cancel.cancel();
    }

    pub fn take_failure(&self) -> Option<PushError> {
        self.failure.lock().ok().and_then(|mut slot| slot.take())
    }
}
