// src/constants.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

/// Smallest buffer the planner will hand out (16 MiB)
pub const MIN_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Largest buffer for the direct transport (256 MiB)
/// A single LOAD DATA statement carries one buffer, so keep statements bounded
pub const MAX_DIRECT_BUFFER_SIZE: usize = 256 * 1024 * 1024;

/// Largest buffer for the staged transport (1 GiB)
/// One buffer becomes one staged object
pub const MAX_STAGED_BUFFER_SIZE: usize = 1024 * 1024 * 1024;

/// Upper bound on the memory budget, in GiB
pub const MAX_RAM_GIB: u64 = 255;

/// Upper bound on the per-row payload (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Buffers planned per CPU before the memory budget is applied
pub const BUFFERS_PER_CPU: usize = 4;

/// Ingestion workers per CPU when not overridden
pub const INGESTERS_PER_CPU: usize = 2;

/// Decimal width of i64::MAX ("9223372036854775807")
pub const MAX_INDEX_DIGITS: usize = 19;

/// Separator, terminator and one escape byte counted per row when sizing batches
pub const ROW_OVERHEAD: usize = 3;

/// How often the progress monitor samples counters or the destination
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// How often the completion tracker polls for confirmed batches
pub const TRACKER_INTERVAL: Duration = Duration::from_secs(10);

/// How often the warm-up phase checks buffer fill level
pub const WARMUP_INTERVAL: Duration = Duration::from_millis(500);
