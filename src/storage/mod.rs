// src/storage/mod.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Object-storage staging area for the staged transport
//!
//! Objects are keyed by the decimal form of their staged object id.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub mod s3;

pub use s3::S3Store;

/// Storage key for a staged object id
pub fn object_key(id: i64) -> String {
    id.to_string()
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Check that the staging area exists and is reachable
    async fn head(&self) -> Result<()>;

    /// Upload one buffer under `id`
    async fn put(&self, id: i64, body: Bytes) -> Result<()>;

    /// Delete the object stored under `id`
    async fn delete(&self, id: i64) -> Result<()>;

    /// Delete every object in the staging area
    async fn delete_all(&self) -> Result<()>;
}
