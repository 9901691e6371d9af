// src/tracker.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Completion tracker for the staged transport
//!
//! Deletes staged objects once the destination confirms consuming them.
//! The cursor only moves through a contiguous prefix of confirmed ids, so
//! objects are deleted in strictly increasing order and never early.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::destination::StagedIngestion;
use crate::error::{PushError, Result};
use crate::storage::ObjectStore;

/// Ids from an ascending confirmation list that extend `cursor` without a gap
pub fn contiguous_run(cursor: i64, confirmed: &[i64]) -> Vec<i64> {
    let mut next = cursor + 1;
    let mut run = Vec::new();
    for &id in confirmed {
        if id == next {
            run.push(id);
            next += 1;
        }
    }
    run
}

/// Outcome of a finished tracker loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerReport {
    /// Highest id confirmed and deleted
    pub cursor: i64,
    /// Objects deleted, in deletion order
    pub deleted: Vec<i64>,
    /// Confirmed ids still held behind a gap when the loop stopped
    pub pending: Vec<i64>,
    pub polls: u64,
}

pub struct CompletionTracker {
    ingestion: Arc<dyn StagedIngestion>,
    store: Arc<dyn ObjectStore>,
    interval: Duration,
    cursor: i64,
}

impl CompletionTracker {
    pub fn new(
        ingestion: Arc<dyn StagedIngestion>,
        store: Arc<dyn ObjectStore>,
        interval: Duration,
    ) -> Self {
        Self {
            ingestion,
            store,
            interval,
            cursor: 0,
        }
    }

    /// Run the loop on the current runtime
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<Result<TrackerReport>> {
        tokio::spawn(self.run(cancel))
    }

    /// Poll until the pipeline has stopped and a later poll advances nothing
    ///
    /// Cancellation ends the loop early with the report so far.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<TrackerReport> {
        tracing::info!("Completion tracker started (interval {:?})", self.interval);
        let mut report = TrackerReport::default();
        let mut stopped = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("Completion tracker cancelled at cursor {}", self.cursor);
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            report.polls += 1;
            let confirmed = self.poll().await?;
            let run = contiguous_run(self.cursor, &confirmed);

            for id in &run {
                self.store
                    .delete(*id)
                    .await
                    .map_err(|e| self.wrap(e))?;
                self.cursor = *id;
                report.deleted.push(*id);
            }
            if !run.is_empty() {
                tracing::debug!(
                    "Deleted staged objects {}..={}",
                    run[0],
                    self.cursor
                );
                continue;
            }

            if stopped {
                report.pending = confirmed;
                break;
            }
            let running = self
                .ingestion
                .is_running()
                .await
                .map_err(|e| self.wrap(e))?;
            if !running {
                // One more poll picks up confirmations that raced the stop
                stopped = true;
                continue;
            }
            if !confirmed.is_empty() {
                tracing::debug!(
                    "Waiting on object {} ({} confirmations held)",
                    self.cursor + 1,
                    confirmed.len()
                );
            }
        }

        if !report.pending.is_empty() {
            tracing::warn!(
                "Pipeline stopped with {} confirmed objects behind missing object {}",
                report.pending.len(),
                self.cursor + 1
            );
        }
        report.cursor = self.cursor;
        tracing::info!(
            "Completion tracker finished: {} objects deleted, cursor {}",
            report.deleted.len(),
            self.cursor
        );
        Ok(report)
    }

    async fn poll(&self) -> Result<Vec<i64>> {
        let mut confirmed = self
            .ingestion
            .confirmed_after(self.cursor)
            .await
            .map_err(|e| self.wrap(e))?;
        confirmed.sort_unstable();
        confirmed.dedup();
        Ok(confirmed)
    }

    fn wrap(&self, err: PushError) -> PushError {
        PushError::Tracker {
            cursor: self.cursor,
            source: Box::new(err),
        }
    }
}
