// src/runner.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run controller: wires the pool, generators, ingesters and tracker together
//!
//! The controller never holds a queue end. Once the ingestion side has been
//! handed to the workers, generators unblock as soon as the last ingester
//! exits, so a failed run always drains.

use chrono::{DateTime, Local};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{PipelineConfig, StagingArea};
use crate::destination::{Destination, StagedIngestion};
use crate::error::{PushError, Result};
use crate::generator::spawn_generators;
use crate::ingest::{join_ingesters, spawn_ingesters, DirectTransport, StagedTransport};
use crate::pool::{BufferPool, IngestSide};
use crate::progress::{
    format_bytes, format_rate, load_bar, spawn_counter_monitor, wait_for_row_count, warmup_bar,
    wait_for_warmup,
};
use crate::state::RunState;
use crate::storage::ObjectStore;
use crate::tracker::{CompletionTracker, TrackerReport};

/// Where the run sends its rows
pub enum Target {
    /// Bulk-load every buffer straight into the table
    Direct { destination: Arc<dyn Destination> },
    /// Upload buffers to a staging area and let a pipeline ingest them
    Staged {
        destination: Arc<dyn Destination>,
        ingestion: Arc<dyn StagedIngestion>,
        store: Arc<dyn ObjectStore>,
        staging: StagingArea,
    },
}

impl Target {
    fn destination(&self) -> Arc<dyn Destination> {
        match self {
            Target::Direct { destination } | Target::Staged { destination, .. } => {
                Arc::clone(destination)
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Target::Direct { .. } => "direct",
            Target::Staged { .. } => "staged",
        }
    }
}

/// Summary of a completed run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub transport: &'static str,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    /// Load phase only; warm-up is excluded
    pub elapsed: Duration,
    pub rows: u64,
    pub payload_bytes: u64,
    pub batches: u64,
    /// Row count reported by the destination at the end, if the query succeeded
    pub destination_rows: Option<u64>,
    /// Staged objects uploaded
    pub objects: Option<i64>,
    pub tracker: Option<TrackerReport>,
}

impl RunReport {
    pub fn rows_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.rows as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Start time:   {}", self.started.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "End time:     {}", self.finished.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "Elapsed time: {:.3}s", self.elapsed.as_secs_f64())?;
        writeln!(
            f,
            "Loaded:       {} rows, {} payload ({} batches, {})",
            self.rows,
            format_bytes(self.payload_bytes),
            self.batches,
            self.transport
        )?;
        if let Some(objects) = self.objects {
            writeln!(f, "Objects:      {}", objects)?;
        }
        if let Some(rows) = self.destination_rows {
            writeln!(f, "Table rows:   {}", rows)?;
        }
        write!(
            f,
            "Throughput:   {:.0} rows/s, {}",
            self.rows_per_sec(),
            format_rate(self.payload_bytes, self.elapsed)
        )
    }
}

/// Run the whole pipeline once
///
/// Recreates the table, fills the buffers, then times the load phase. The
/// first fatal error cancels every worker and is returned once they have
/// all stopped.
pub async fn run(config: &PipelineConfig, target: Target) -> Result<RunReport> {
    let destination = target.destination();
    destination.recreate_table().await?;

    let state = Arc::new(RunState::new(config.num_rows));
    let pool = BufferPool::new(config.num_buffers, config.buffer_capacity);
    tracing::info!(
        "Buffer pool: {} x {}, batch size {} rows",
        pool.num_buffers(),
        format_bytes(pool.buffer_capacity() as u64),
        config.batch_size()
    );
    let (generator_side, ingest_side) = pool.split();
    let generators = spawn_generators(config.generator_config(), generator_side, Arc::clone(&state))?;

    tracing::info!("Generating test data locally (filling buffers)");
    let bar = warmup_bar(config.num_buffers as u64, config.show_progress);
    wait_for_warmup(&state, config.num_buffers, config.warmup_interval, &bar).await;

    let started = Local::now();
    let clock = Instant::now();
    tracing::info!("Start time: {}", started.format("%Y-%m-%d %H:%M:%S"));

    let transport = target.name();
    let outcome = match target {
        Target::Direct { destination } => {
            run_direct(config, &state, ingest_side, destination).await;
            Ok((None, None))
        }
        Target::Staged {
            destination,
            ingestion,
            store,
            staging,
        } => {
            run_staged(
                config,
                &state,
                ingest_side,
                destination,
                ingestion,
                store,
                &staging,
            )
            .await
            .map(|tracker| (tracker, Some(state.last_object_id())))
        }
    };
    let (tracker, objects) = match outcome {
        Ok(staged) => staged,
        Err(e) => {
            state.fail(e);
            (None, None)
        }
    };

    if let Err(e) = generators.join().await {
        state.fail(e);
    }
    if let Some(err) = state.take_failure() {
        return Err(err);
    }

    let elapsed = clock.elapsed();
    let finished = Local::now();
    let destination_rows = match destination.row_count().await {
        Ok(rows) => Some(rows),
        Err(e) => {
            tracing::warn!("Final row count query failed: {}", e);
            None
        }
    };

    let report = RunReport {
        transport,
        started,
        finished,
        elapsed,
        rows: state.loaded_rows(),
        payload_bytes: state.loaded_bytes(),
        batches: state.generated_batches(),
        destination_rows,
        objects,
        tracker,
    };
    tracing::info!("End time: {}", finished.format("%Y-%m-%d %H:%M:%S"));
    Ok(report)
}

/// Bulk-load workers until the ready queue closes
async fn run_direct(
    config: &PipelineConfig,
    state: &Arc<RunState>,
    queues: IngestSide,
    destination: Arc<dyn Destination>,
) {
    tracing::info!("Using LOAD DATA LOCAL INFILE method");
    let transport = Arc::new(DirectTransport::new(destination));
    let ingesters = spawn_ingesters(
        config.ingest_workers,
        transport,
        queues,
        Arc::clone(state),
        config.payload_size,
    );

    let stop = CancellationToken::new();
    let monitor = spawn_counter_monitor(
        Arc::clone(state),
        load_bar(config.total_payload_bytes(), config.show_progress),
        config.progress_interval,
        stop.clone(),
    );

    join_ingesters(ingesters, state).await;
    stop.cancel();
    if let Err(e) = monitor.await {
        tracing::warn!("Progress monitor ended abnormally: {}", e);
    }
}

/// Upload workers plus pipeline and tracker, with teardown on every path
async fn run_staged(
    config: &PipelineConfig,
    state: &Arc<RunState>,
    queues: IngestSide,
    destination: Arc<dyn Destination>,
    ingestion: Arc<dyn StagedIngestion>,
    store: Arc<dyn ObjectStore>,
    staging: &StagingArea,
) -> Result<Option<TrackerReport>> {
    tracing::info!("Connecting to S3 and ensuring empty bucket");
    let transport = Arc::new(StagedTransport::new(Arc::clone(&store), Arc::clone(state)));
    transport.prepare().await?;

    tracing::info!("Starting upload to S3");
    let uploaders = spawn_ingesters(
        config.ingest_workers,
        transport,
        queues,
        Arc::clone(state),
        config.payload_size,
    );

    let mut pipeline_created = false;
    let loaded = async {
        tracing::info!("Creating pipeline");
        ingestion.create_pipeline(staging).await?;
        pipeline_created = true;

        tracing::info!("Starting pipeline");
        ingestion.start_pipeline().await?;

        let tracker = spawn_tracker(
            CompletionTracker::new(
                Arc::clone(&ingestion),
                Arc::clone(&store),
                config.tracker_interval,
            ),
            state,
        );

        let bar = load_bar(config.total_payload_bytes(), config.show_progress);
        let reached = wait_for_row_count(
            destination.as_ref(),
            state,
            config.num_rows as u64,
            config.payload_size,
            config.progress_interval,
            &bar,
        )
        .await;

        tracing::info!("Stopping pipeline");
        ingestion.stop_pipeline().await?;
        tracing::info!("Dropping pipeline");
        ingestion.drop_pipeline().await?;
        pipeline_created = false;

        tracing::info!("Waiting for cleanup of bucket");
        let report = tracker
            .await
            .map_err(|e| PushError::Invariant(format!("completion tracker panicked: {e}")))?;
        if reached {
            store.delete_all().await?;
        }
        Ok::<_, PushError>(report)
    }
    .await;

    let report = match loaded {
        Ok(report) => report,
        Err(e) => {
            state.fail(e);
            if pipeline_created {
                teardown_pipeline(ingestion.as_ref()).await;
            }
            None
        }
    };

    join_ingesters(uploaders, state).await;
    Ok(report)
}

/// Run the tracker in the background; its errors fail the run
fn spawn_tracker(
    tracker: CompletionTracker,
    state: &Arc<RunState>,
) -> JoinHandle<Option<TrackerReport>> {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        match tracker.run(state.cancel_token()).await {
            Ok(report) => Some(report),
            Err(e) => {
                state.fail(e);
                None
            }
        }
    })
}

async fn teardown_pipeline(ingestion: &dyn StagedIngestion) {
    if let Err(e) = ingestion.stop_pipeline().await {
        tracing::warn!("Stopping pipeline after failure: {}", e);
    }
    if let Err(e) = ingestion.drop_pipeline().await {
        tracing::warn!("Dropping pipeline after failure: {}", e);
    }
}
