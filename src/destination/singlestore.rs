// src/destination/singlestore.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SingleStore over the MySQL wire protocol
//!
//! Direct loads use `LOAD DATA LOCAL INFILE` with a per-connection infile
//! handler that streams the lent buffer. Staged loads use a `PIPELINE`
//! reading the S3 bucket, tracked through `INFORMATION_SCHEMA`.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::future::Future;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, Pool, SslOpts};
use tracing::{debug, info};

use super::{Destination, StagedIngestion};
use crate::config::{ConnectionConfig, StagingArea};
use crate::error::{PushError, Result};

pub struct SingleStoreDestination {
    pool: Pool,
    database: String,
    table: String,
}

impl SingleStoreDestination {
    pub fn connect(conn: &ConnectionConfig, table: &str) -> Self {
        let mut opts = OptsBuilder::default()
            .ip_or_hostname(conn.host.clone())
            .tcp_port(conn.port)
            .user(Some(conn.user.clone()))
            .pass(Some(conn.password.clone()))
            .db_name(Some(conn.database.clone()));
        if conn.tls {
            opts = opts.ssl_opts(Some(
                SslOpts::default().with_danger_accept_invalid_certs(true),
            ));
        }

        info!(
            "SingleStore destination {}:{}/{} table {}",
            conn.host, conn.port, conn.database, table
        );

        Self {
            pool: Pool::new(opts),
            database: conn.database.clone(),
            table: table.to_string(),
        }
    }

    async fn conn(&self) -> Result<Conn> {
        Ok(self.pool.get_conn().await?)
    }

    async fn execute(&self, statement: String) -> Result<()> {
        debug!("Executing: {}", statement);
        let mut conn = self.conn().await?;
        conn.query_drop(statement.as_str())
            .await
            .map_err(|e| PushError::statement(&statement, e))
    }

    /// Close pooled connections
    pub async fn disconnect(self) -> Result<()> {
        self.pool.disconnect().await?;
        Ok(())
    }
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE {table} (
    documentID BIGINT NOT NULL,
    payload LONGBLOB NOT NULL,
    SORT KEY(documentID),
    SHARD KEY(documentID))"
    )
}

fn create_pipeline_sql(table: &str, staging: &StagingArea) -> String {
    let config = serde_json::json!({ "region": staging.region });
    let credentials = serde_json::json!({
        "aws_access_key_id": staging.access_key_id,
        "aws_secret_access_key": staging.secret_access_key,
        "aws_session_token": staging.session_token,
    });
    format!(
        "CREATE PIPELINE {table} AS LOAD DATA S3 '{bucket}' CONFIG '{config}' CREDENTIALS '{credentials}' INTO TABLE {table}",
        bucket = staging.bucket,
    )
}

const CONFIRMED_BATCHES_SQL: &str = "SELECT BATCH_SOURCE_PARTITION_ID:>BIGINT \
     FROM INFORMATION_SCHEMA.pipelines_batches \
     WHERE DATABASE_NAME = ? AND PIPELINE_NAME = ? AND BATCH_STATE = 'SUCCEEDED' \
     AND BATCH_SOURCE_PARTITION_ID:>BIGINT > ? \
     ORDER BY BATCH_SOURCE_PARTITION_ID:>BIGINT";

const RUNNING_PIPELINES_SQL: &str = "SELECT COUNT(*) FROM INFORMATION_SCHEMA.pipelines \
     WHERE STATE = 'Running' AND DATABASE_NAME = ? AND PIPELINE_NAME = ?";

#[async_trait]
impl Destination for SingleStoreDestination {
    async fn recreate_table(&self) -> Result<()> {
        self.execute(format!("DROP TABLE IF EXISTS {}", self.table))
            .await?;
        self.execute(create_table_sql(&self.table)).await?;
        info!("Recreated table {}", self.table);
        Ok(())
    }

    async fn row_count(&self) -> Result<u64> {
        let statement = format!("SELECT COUNT(*) FROM {}", self.table);
        let mut conn = self.conn().await?;
        let count: Option<u64> = conn
            .query_first(statement.as_str())
            .await
            .map_err(|e| PushError::statement(&statement, e))?;
        count.ok_or_else(|| PushError::statement(statement, "no rows returned"))
    }

    async fn load_batch(&self, slot: &str, data: Bytes) -> Result<u64> {
        let statement = format!("LOAD DATA LOCAL INFILE '{}' INTO TABLE {}", slot, self.table);
        let mut conn = self.conn().await?;

        // The handler is consumed by the next LOCAL INFILE request on this
        // connection, so registration and the statement stay paired.
        conn.set_infile_handler(infile_body(data));

        conn.query_drop(statement.as_str())
            .await
            .map_err(|e| PushError::statement(&statement, e))?;
        let rows = conn.affected_rows();
        debug!("{}: loaded {} rows", slot, rows);
        Ok(rows)
    }
}

/// Infile handler that answers one `LOCAL INFILE` request with `data` as a single chunk
fn infile_body(
    data: Bytes,
) -> impl Future<Output = mysql_async::Result<BoxStream<'static, std::io::Result<Bytes>>>>
       + Send
       + Sync
       + 'static {
    async move {
        let body = futures_util::stream::once(async move { Ok::<_, std::io::Error>(data) });
        Ok::<_, mysql_async::Error>(body.boxed())
    }
}

#[async_trait]
impl StagedIngestion for SingleStoreDestination {
    async fn create_pipeline(&self, staging: &StagingArea) -> Result<()> {
        let statement = create_pipeline_sql(&self.table, staging);
        let mut conn = self.conn().await?;
        // Logged without the statement, which carries credentials
        conn.query_drop(statement.as_str()).await.map_err(|e| {
            PushError::statement(format!("CREATE PIPELINE {}", self.table), e)
        })?;
        info!("Created pipeline {} from s3://{}", self.table, staging.bucket);
        Ok(())
    }

    async fn start_pipeline(&self) -> Result<()> {
        self.execute(format!("START PIPELINE {}", self.table)).await
    }

    async fn stop_pipeline(&self) -> Result<()> {
        self.execute(format!("STOP PIPELINE {}", self.table)).await
    }

    async fn drop_pipeline(&self) -> Result<()> {
        self.execute(format!("DROP PIPELINE {}", self.table)).await
    }

    async fn confirmed_after(&self, cursor: i64) -> Result<Vec<i64>> {
        let mut conn = self.conn().await?;
        conn.exec(
            CONFIRMED_BATCHES_SQL,
            (self.database.as_str(), self.table.as_str(), cursor),
        )
        .await
        .map_err(|e| PushError::statement(CONFIRMED_BATCHES_SQL, e))
    }

    async fn is_running(&self) -> Result<bool> {
        let mut conn = self.conn().await?;
        let running: Option<i64> = conn
            .exec_first(
                RUNNING_PIPELINES_SQL,
                (self.database.as_str(), self.table.as_str()),
            )
            .await
            .map_err(|e| PushError::statement(RUNNING_PIPELINES_SQL, e))?;
        Ok(running.unwrap_or(0) > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staging() -> StagingArea {
        StagingArea {
            bucket: "bench-bucket".to_string(),
            region: "us-west-2".to_string(),
            access_key_id: "AKIAEXAMPLE".to_string(),
            secret_access_key: "s3cr3t".to_string(),
            session_token: "tok".to_string(),
            endpoint: None,
        }
    }

    #[tokio::test]
    async fn test_infile_body_streams_batch_once() {
        let data = Bytes::from_static(b"0\tab\n1\tc\\\td\n");
        let mut body = infile_body(data.clone()).await.unwrap();

        let chunk = body.next().await.expect("one chunk").unwrap();
        assert_eq!(chunk, data);
        assert_eq!(chunk.as_ptr(), data.as_ptr());
        assert!(body.next().await.is_none());
    }

    #[test]
    fn test_create_table_shape() {
        let sql = create_table_sql("bench");
        assert!(sql.starts_with("CREATE TABLE bench ("));
        assert!(sql.contains("documentID BIGINT NOT NULL"));
        assert!(sql.contains("payload LONGBLOB NOT NULL"));
        assert!(sql.contains("SORT KEY(documentID)"));
        assert!(sql.contains("SHARD KEY(documentID)"));
    }

    #[test]
    fn test_create_pipeline_embeds_config_and_credentials() {
        let sql = create_pipeline_sql("bench", &staging());
        assert!(sql.starts_with("CREATE PIPELINE bench AS LOAD DATA S3 'bench-bucket'"));
        assert!(sql.contains(r#"CONFIG '{"region":"us-west-2"}'"#));
        assert!(sql.contains(r#""aws_access_key_id":"AKIAEXAMPLE""#));
        assert!(sql.contains(r#""aws_session_token":"tok""#));
        assert!(sql.ends_with("INTO TABLE bench"));
    }
}
