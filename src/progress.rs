// src/progress.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Progress rendering and the polling loops behind it
//!
//! Everything here only reads counters or queries the destination. A failed
//! row-count query is logged and retried on the next tick.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::destination::Destination;
use crate::format::payload_bytes;
use crate::state::RunState;

fn styled(bar: ProgressBar, template: &str) -> ProgressBar {
    match ProgressStyle::with_template(template) {
        Ok(style) => bar.with_style(style.progress_chars("#>-")),
        Err(e) => {
            tracing::debug!("progress template rejected: {}", e);
            bar
        }
    }
}

/// Bytes bar for the load phase
pub fn load_bar(total_bytes: u64, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    styled(
        ProgressBar::new(total_bytes),
        "{msg} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    )
    .with_message("loading")
}

/// Buffer count bar for warm-up
pub fn warmup_bar(num_buffers: u64, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    styled(
        ProgressBar::new(num_buffers),
        "{msg} [{elapsed_precise}] [{wide_bar:.green}] {pos}/{len} buffers",
    )
    .with_message("warming up")
}

/// Format bytes into human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Bytes per second over `elapsed`, human readable
pub fn format_rate(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return "n/a".to_string();
    }
    format!("{}/s", format_bytes((bytes as f64 / secs) as u64))
}

/// Wait until every buffer holds a batch, or every row has been generated
///
/// Returns early if the run is cancelled.
pub async fn wait_for_warmup(
    state: &RunState,
    num_buffers: usize,
    interval: Duration,
    bar: &ProgressBar,
) {
    let num_rows = state.num_rows() as u64;
    loop {
        let batches = state.generated_batches();
        bar.set_position(batches.min(num_buffers as u64));
        if batches >= num_buffers as u64 || state.generated_rows() >= num_rows {
            break;
        }
        tokio::select! {
            _ = state.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    bar.finish_and_clear();
    tracing::info!(
        "Warm-up done: {} batches ({} rows) buffered",
        state.generated_batches(),
        state.generated_rows()
    );
}

/// Render the loaded-bytes counter until `stop` fires
pub fn spawn_counter_monitor(
    state: Arc<RunState>,
    bar: ProgressBar,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            bar.set_position(state.loaded_bytes());
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        bar.set_position(state.loaded_bytes());
        bar.finish();
    })
}

/// Poll the destination row count until it reaches `target`
///
/// Returns `false` if the run was cancelled first.
pub async fn wait_for_row_count(
    destination: &dyn Destination,
    state: &RunState,
    target: u64,
    payload_size: usize,
    interval: Duration,
    bar: &ProgressBar,
) -> bool {
    loop {
        match destination.row_count().await {
            Ok(rows) => {
                bar.set_position(payload_bytes(rows, payload_size));
                if rows >= target {
                    if rows > target {
                        tracing::warn!("Destination holds {} rows, expected {}", rows, target);
                    }
                    bar.finish();
                    return true;
                }
            }
            Err(e) => tracing::warn!("Row count query failed, retrying: {}", e),
        }
        tokio::select! {
            _ = state.cancelled() => {
                bar.abandon();
                return false;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDestination;
    use crate::format::write_row;
    use bytes::Bytes;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
        assert_eq!(format_bytes(1099511627776), "1.00 TB");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(2048, Duration::from_secs(2)), "1.00 KB/s");
        assert_eq!(format_rate(10, Duration::ZERO), "n/a");
    }

    #[test]
    fn test_hidden_bars() {
        assert!(load_bar(100, false).is_hidden());
        assert_eq!(warmup_bar(8, true).length(), Some(8));
    }

    #[tokio::test]
    async fn test_warmup_returns_once_rows_are_generated() {
        let state = RunState::new(10);
        state.record_generated(10);
        wait_for_warmup(&state, 4, Duration::from_millis(1), &ProgressBar::hidden()).await;
        assert_eq!(state.generated_batches(), 1);
    }

    #[tokio::test]
    async fn test_warmup_returns_on_cancel() {
        let state = RunState::new(10);
        state.cancel_token().cancel();
        wait_for_warmup(&state, 4, Duration::from_millis(1), &ProgressBar::hidden()).await;
    }

    #[tokio::test]
    async fn test_wait_for_row_count() {
        let dest = MemoryDestination::new();
        let state = RunState::new(3);
        let mut rows = Vec::new();
        for i in 0..3 {
            write_row(&mut rows, i, b"xy");
        }
        dest.load_batch("slot-0", Bytes::from(rows)).await.unwrap();

        let reached = wait_for_row_count(
            &dest,
            &state,
            3,
            2,
            Duration::from_millis(1),
            &ProgressBar::hidden(),
        )
        .await;
        assert!(reached);

        state.cancel_token().cancel();
        let reached = wait_for_row_count(
            &dest,
            &state,
            4,
            2,
            Duration::from_millis(1),
            &ProgressBar::hidden(),
        )
        .await;
        assert!(!reached);
    }
}
