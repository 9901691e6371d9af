// src/error.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types shared by the pipeline, transports and tracker
//!
//! Every variant is fatal to the run. The controller reports the first one
//! captured and exits non-zero.

use thiserror::Error;

pub type Result<T, E = PushError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("destination error: {0}")]
    Destination(#[from] mysql_async::Error),

    #[error("destination statement `{statement}` failed: {message}")]
    Statement { statement: String, message: String },

    #[error("storage {operation} failed{}: {message}", key_suffix(.key))]
    Storage {
        operation: &'static str,
        key: Option<String>,
        message: String,
    },

    #[error("ingestion slot {slot} failed loading {rows} rows ({bytes} bytes): {source}")]
    Transport {
        slot: String,
        rows: u64,
        bytes: usize,
        #[source]
        source: Box<PushError>,
    },

    #[error("completion tracker stopped at cursor {cursor}: {source}")]
    Tracker {
        cursor: i64,
        #[source]
        source: Box<PushError>,
    },

    #[error("failed to build {role} worker pool: {message}")]
    WorkerPool { role: &'static str, message: String },

    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

fn key_suffix(key: &Option<String>) -> String {
    match key {
        Some(key) => format!(" for key {key}"),
        None => String::new(),
    }
}

impl PushError {
    /// Wrap a storage SDK error, keeping the full error chain in the message
    pub fn storage<E>(operation: &'static str, key: Option<String>, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        PushError::Storage {
            operation,
            key,
            message: aws_sdk_s3::error::DisplayErrorContext(err).to_string(),
        }
    }

    pub fn statement(statement: impl Into<String>, err: impl std::fmt::Display) -> Self {
        PushError::Statement {
            statement: statement.into(),
            message: err.to_string(),
        }
    }
}
