// src/main.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use megapush::destination::SingleStoreDestination;
use megapush::storage::S3Store;
use megapush::{run, Args, RunConfig, Target};

#[tokio::main]
async fn main() -> ExitCode {
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();

    let args = Args::parse();
    match execute(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("megapush failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(args: Args) -> anyhow::Result<()> {
    let RunConfig {
        connection,
        table,
        pipeline,
        staging,
    } = args.into_config().context("invalid arguments")?;

    let singlestore = Arc::new(SingleStoreDestination::connect(&connection, &table));

    let target = match staging {
        None => Target::Direct {
            destination: singlestore.clone(),
        },
        Some(staging) => {
            let store = S3Store::connect(&staging)
                .await
                .with_context(|| format!("connecting to bucket {}", staging.bucket))?;
            Target::Staged {
                destination: singlestore.clone(),
                ingestion: singlestore.clone(),
                store: Arc::new(store),
                staging,
            }
        }
    };

    let outcome = run(&pipeline, target)
        .await
        .with_context(|| format!("loading {} rows into {}", pipeline.num_rows, table));

    if let Ok(destination) = Arc::try_unwrap(singlestore) {
        if let Err(e) = destination.disconnect().await {
            tracing::warn!("Closing destination connections: {}", e);
        }
    }

    let report = outcome?;
    println!("{report}");
    println!("done");
    Ok(())
}
