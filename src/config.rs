// src/config.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-line surface, validation and buffer planning
//!
//! Everything here runs before the pipeline starts; any failure is a
//! configuration error and the run never begins.

use clap::Parser;
use std::fmt;
use std::time::Duration;

use crate::constants::*;
use crate::error::{PushError, Result};
use crate::format::payload_bytes;
use crate::generator::GeneratorConfig;

#[derive(Debug, Parser)]
#[command(
    name = "megapush",
    version,
    about = "Generate synthetic rows and push them into SingleStore as fast as memory allows"
)]
pub struct Args {
    /// Memory budget for row buffers, in GiB
    pub ram_gib: u64,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub table: String,
    /// Total rows to generate and load
    pub num_rows: u64,
    /// Random payload bytes per row
    pub payload_size: usize,
    /// Stage through this S3 bucket and a server-side pipeline instead of LOAD DATA LOCAL
    pub s3_bucket: Option<String>,

    /// Seed payload generation for reproducible data
    #[arg(long)]
    pub seed: Option<u64>,

    /// Generator workers (default: CPU count)
    #[arg(long)]
    pub generators: Option<usize>,

    /// Ingestion workers (default: 2 x CPU count)
    #[arg(long)]
    pub ingesters: Option<usize>,

    /// Connect without TLS (by default TLS is used without verifying the server certificate)
    #[arg(long)]
    pub no_tls: bool,

    /// S3-compatible endpoint (path-style addressing)
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// Do not render progress bars
    #[arg(long)]
    pub no_progress: bool,

    #[arg(long, env = "AWS_REGION", hide_env_values = true)]
    pub aws_region: Option<String>,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub aws_access_key_id: Option<String>,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub aws_secret_access_key: Option<String>,

    #[arg(long, env = "AWS_SESSION_TOKEN", hide_env_values = true)]
    pub aws_session_token: Option<String>,
}

/// Destination connection parameters
#[derive(Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub tls: bool,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("tls", &self.tls)
            .finish()
    }
}

/// Object-storage staging area and the credentials the destination uses to read it
#[derive(Clone)]
pub struct StagingArea {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub endpoint: Option<String>,
}

impl fmt::Debug for StagingArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingArea")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Everything the pipeline itself needs, independent of where rows go
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub num_rows: i64,
    pub payload_size: usize,
    pub num_buffers: usize,
    pub buffer_capacity: usize,
    pub generator_workers: usize,
    pub ingest_workers: usize,
    pub seed: Option<u64>,
    pub show_progress: bool,
    pub progress_interval: Duration,
    pub tracker_interval: Duration,
    pub warmup_interval: Duration,
}

impl PipelineConfig {
    /// Pipeline settings for `num_rows` rows with the planner's defaults
    pub fn new(num_rows: i64, payload_size: usize, num_buffers: usize, buffer_capacity: usize) -> Self {
        let cpus = num_cpus::get();
        Self {
            num_rows,
            payload_size,
            num_buffers,
            buffer_capacity,
            generator_workers: cpus,
            ingest_workers: cpus * INGESTERS_PER_CPU,
            seed: None,
            show_progress: true,
            progress_interval: PROGRESS_INTERVAL,
            tracker_interval: TRACKER_INTERVAL,
            warmup_interval: WARMUP_INTERVAL,
        }
    }

    pub fn batch_size(&self) -> i64 {
        GeneratorConfig::batch_size_for(self.buffer_capacity, self.payload_size)
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            payload_size: self.payload_size,
            batch_size: self.batch_size(),
            workers: self.generator_workers,
            seed: self.seed,
        }
    }

    /// Payload bytes the run will deliver, saturating at `u64::MAX`
    pub fn total_payload_bytes(&self) -> u64 {
        payload_bytes(self.num_rows as u64, self.payload_size)
    }
}

/// Validated configuration for one run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub connection: ConnectionConfig,
    pub table: String,
    pub pipeline: PipelineConfig,
    pub staging: Option<StagingArea>,
}

/// Pick buffer count and size from the memory budget
///
/// Aims for `cpus * BUFFERS_PER_CPU` buffers sized to split the payload evenly,
/// clamps the size to the transport's range, then trims the count to fit
/// the budget.
pub fn plan_buffers(
    ram_gib: u64,
    num_rows: i64,
    payload_size: usize,
    staged: bool,
    cpus: usize,
) -> (usize, usize) {
    let target_buffers = (cpus * BUFFERS_PER_CPU).max(1);
    let total_payload = (num_rows as u128) * (payload_size as u128);
    let target_size = (total_payload / target_buffers as u128).min(usize::MAX as u128) as usize;

    let max_size = if staged {
        MAX_STAGED_BUFFER_SIZE
    } else {
        MAX_DIRECT_BUFFER_SIZE
    };
    let buffer_size = target_size.clamp(MIN_BUFFER_SIZE, max_size);

    let budget = (ram_gib as u128) * 1024 * 1024 * 1024;
    let fitting = (budget / buffer_size as u128).min(usize::MAX as u128) as usize;
    let num_buffers = target_buffers.min(fitting).max(1);

    (num_buffers, buffer_size)
}

impl Args {
    /// Validate ranges and presence, then plan buffers and workers
    pub fn into_config(self) -> Result<RunConfig> {
        if self.ram_gib == 0 || self.ram_gib > MAX_RAM_GIB {
            return Err(PushError::Config(format!(
                "ram_gib must be > 0 and <= {}",
                MAX_RAM_GIB
            )));
        }
        if self.num_rows == 0 || self.num_rows > i64::MAX as u64 {
            return Err(PushError::Config(format!(
                "num_rows must be > 0 and <= {}",
                i64::MAX
            )));
        }
        if self.payload_size == 0 || self.payload_size > MAX_PAYLOAD_SIZE {
            return Err(PushError::Config(format!(
                "payload_size must be > 0 and <= {}",
                MAX_PAYLOAD_SIZE
            )));
        }
        if self.table.is_empty() || !self.table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(PushError::Config(format!(
                "table name {:?} must be non-empty and use only [A-Za-z0-9_]",
                self.table
            )));
        }
        if matches!(self.generators, Some(0)) || matches!(self.ingesters, Some(0)) {
            return Err(PushError::Config(
                "worker counts must be at least 1".to_string(),
            ));
        }

        let staging = match self.s3_bucket {
            Some(bucket) => {
                let (Some(region), Some(access_key_id), Some(secret_access_key), Some(session_token)) = (
                    non_empty(self.aws_region),
                    non_empty(self.aws_access_key_id),
                    non_empty(self.aws_secret_access_key),
                    non_empty(self.aws_session_token),
                ) else {
                    return Err(PushError::Config(
                        "AWS_REGION, AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, and AWS_SESSION_TOKEN must be set to use the S3 pipeline".to_string(),
                    ));
                };
                Some(StagingArea {
                    bucket,
                    region,
                    access_key_id,
                    secret_access_key,
                    session_token,
                    endpoint: self.s3_endpoint,
                })
            }
            None => None,
        };

        let num_rows = self.num_rows as i64;
        let cpus = num_cpus::get();
        let (num_buffers, buffer_capacity) = plan_buffers(
            self.ram_gib,
            num_rows,
            self.payload_size,
            staging.is_some(),
            cpus,
        );

        let mut pipeline = PipelineConfig::new(num_rows, self.payload_size, num_buffers, buffer_capacity);
        pipeline.seed = self.seed;
        pipeline.show_progress = !self.no_progress;
        if let Some(n) = self.generators {
            pipeline.generator_workers = n;
        }
        if let Some(n) = self.ingesters {
            pipeline.ingest_workers = n;
        }

        tracing::info!(
            "Planned {} buffers x {} MiB, {} rows per batch, {} generators, {} ingesters",
            pipeline.num_buffers,
            pipeline.buffer_capacity / (1024 * 1024),
            pipeline.batch_size(),
            pipeline.generator_workers,
            pipeline.ingest_workers
        );

        Ok(RunConfig {
            connection: ConnectionConfig {
                host: self.host,
                port: self.port,
                user: self.user,
                password: self.password,
                database: self.database,
                tls: !self.no_tls,
            },
            table: self.table,
            pipeline,
            staging,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "megapush", "4", "localhost", "3306", "root", "pw", "db", "bench", "1000000", "100",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).expect("arguments parse")
    }

    #[test]
    fn test_plan_small_run_uses_minimum_buffer() {
        // 100 MB of payload over 32 buffers is ~3 MiB each, raised to the 16 MiB floor
        let (n, size) = plan_buffers(4, 1_000_000, 100, false, 8);
        assert_eq!(size, MIN_BUFFER_SIZE);
        assert_eq!(n, 32);
    }

    #[test]
    fn test_plan_large_run_clamps_to_transport_max() {
        let (_, direct) = plan_buffers(255, 1 << 40, 1024, false, 8);
        assert_eq!(direct, MAX_DIRECT_BUFFER_SIZE);
        let (_, staged) = plan_buffers(255, 1 << 40, 1024, true, 8);
        assert_eq!(staged, MAX_STAGED_BUFFER_SIZE);
    }

    #[test]
    fn test_plan_respects_memory_budget() {
        // 1 GiB budget with 256 MiB buffers fits 4, not 64
        let (n, size) = plan_buffers(1, 1 << 40, 1024, false, 16);
        assert_eq!(size, 256 * MIB);
        assert_eq!(n, 4);
        assert!(n * size <= 1024 * MIB);

        // 1 GiB budget with 1 GiB staged buffers still gets one
        let (n, size) = plan_buffers(1, 1 << 40, 1024, true, 16);
        assert_eq!(size, 1024 * MIB);
        assert_eq!(n, 1);
    }

    #[test]
    fn test_direct_config_from_args() {
        let config = args(&["--seed", "7", "--generators", "3", "--ingesters", "5"])
            .into_config()
            .unwrap();
        assert!(config.staging.is_none());
        assert_eq!(config.table, "bench");
        assert_eq!(config.connection.port, 3306);
        assert_eq!(config.pipeline.num_rows, 1_000_000);
        assert_eq!(config.pipeline.seed, Some(7));
        assert_eq!(config.pipeline.generator_workers, 3);
        assert_eq!(config.pipeline.ingest_workers, 5);
        assert!(config.pipeline.num_buffers * config.pipeline.buffer_capacity <= 4 * 1024 * MIB);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut a = args(&[]);
        a.ram_gib = 0;
        assert!(matches!(a.into_config(), Err(PushError::Config(_))));

        let mut a = args(&[]);
        a.ram_gib = 256;
        assert!(matches!(a.into_config(), Err(PushError::Config(_))));

        let mut a = args(&[]);
        a.num_rows = 0;
        assert!(matches!(a.into_config(), Err(PushError::Config(_))));

        let mut a = args(&[]);
        a.num_rows = u64::MAX;
        assert!(matches!(a.into_config(), Err(PushError::Config(_))));

        let mut a = args(&[]);
        a.payload_size = MAX_PAYLOAD_SIZE + 1;
        assert!(matches!(a.into_config(), Err(PushError::Config(_))));

        let mut a = args(&[]);
        a.table = "bench; DROP TABLE x".to_string();
        assert!(matches!(a.into_config(), Err(PushError::Config(_))));

        let mut a = args(&[]);
        a.ingesters = Some(0);
        assert!(matches!(a.into_config(), Err(PushError::Config(_))));
    }

    #[test]
    fn test_staging_requires_all_credentials() {
        let mut a = args(&[]);
        a.s3_bucket = Some("bucket".to_string());
        a.aws_region = Some("us-east-1".to_string());
        a.aws_access_key_id = Some("AKIA".to_string());
        a.aws_secret_access_key = Some("s3cr3t-value".to_string());
        a.aws_session_token = None;
        assert!(matches!(a.into_config(), Err(PushError::Config(_))));

        let mut a = args(&[]);
        a.s3_bucket = Some("bucket".to_string());
        a.aws_region = Some("us-east-1".to_string());
        a.aws_access_key_id = Some("AKIA".to_string());
        a.aws_secret_access_key = Some("s3cr3t-value".to_string());
        a.aws_session_token = Some("session-tok-value".to_string());
        let config = a.into_config().unwrap();
        let staging = config.staging.expect("staging area");
        assert_eq!(staging.bucket, "bucket");
        assert_eq!(staging.secret_access_key, "s3cr3t-value");

        let shown = format!("{:?}", staging);
        assert!(!shown.contains("s3cr3t-value"), "{shown}");
        assert!(!shown.contains("session-tok-value"), "{shown}");
        assert_eq!(shown.matches("<redacted>").count(), 2, "{shown}");
        assert!(shown.contains("AKIA"));
    }

    #[test]
    fn test_connection_password_is_redacted() {
        let config = args(&[]).into_config().unwrap();
        let shown = format!("{:?}", config.connection);
        assert!(shown.contains("<redacted>"), "{shown}");
        assert!(!shown.contains("\"pw\""), "{shown}");
    }

    #[test]
    fn test_tls_on_by_default() {
        let config = args(&[]).into_config().unwrap();
        assert!(config.connection.tls);

        let config = args(&["--no-tls"]).into_config().unwrap();
        assert!(!config.connection.tls);
    }

    #[test]
    fn test_total_payload_bytes_saturates() {
        let config = PipelineConfig::new(1000, 16, 2, MIB);
        assert_eq!(config.total_payload_bytes(), 16_000);

        let config = PipelineConfig::new(100_000_000_000_000, MAX_PAYLOAD_SIZE, 2, MIB);
        assert_eq!(config.total_payload_bytes(), u64::MAX);

        let config = PipelineConfig::new(i64::MAX, MAX_PAYLOAD_SIZE, 2, MIB);
        assert_eq!(config.total_payload_bytes(), u64::MAX);
    }
}
