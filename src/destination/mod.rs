// src/destination/mod.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Destination database seams
//!
//! [`Destination`] covers what both transports need; [`StagedIngestion`] is
//! the server-side pipeline the staged transport and the completion tracker
//! drive.

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::StagingArea;
use crate::error::Result;

pub mod singlestore;

pub use singlestore::SingleStoreDestination;

#[async_trait]
pub trait Destination: Send + Sync {
    /// Drop the target table if present and create it empty
    async fn recreate_table(&self) -> Result<()>;

    /// Rows currently in the target table
    async fn row_count(&self) -> Result<u64>;

    /// Bulk-load one formatted buffer, exposed to the server under `slot`.
    /// Returns the number of rows the server reports as loaded.
    async fn load_batch(&self, slot: &str, data: Bytes) -> Result<u64>;
}

#[async_trait]
pub trait StagedIngestion: Send + Sync {
    /// Create the server-side pipeline reading from `staging`
    async fn create_pipeline(&self, staging: &StagingArea) -> Result<()>;

    async fn start_pipeline(&self) -> Result<()>;

    async fn stop_pipeline(&self) -> Result<()>;

    async fn drop_pipeline(&self) -> Result<()>;

    /// Staged object ids greater than `cursor` that the pipeline has durably
    /// consumed, ascending
    async fn confirmed_after(&self, cursor: i64) -> Result<Vec<i64>>;

    /// Whether the pipeline is still reported as running
    async fn is_running(&self) -> Result<bool>;
}
