// Benchmark for end-to-end pipeline throughput
// Runs the full generator -> pool -> ingester path into a discarding
// destination, for several buffer sizes

use megapush::testing::MemoryDestination;
use megapush::{run, PipelineConfig, Target};
use std::sync::Arc;

const NUM_ROWS: i64 = 20_000_000;
const PAYLOAD_SIZE: usize = 100;
const ITERATIONS: usize = 3;
const MEMORY_BUDGET: usize = 8 * 1024 * 1024 * 1024; // 8 GB of buffers at most

async fn benchmark_buffer_size(buffer_size: usize) -> anyhow::Result<()> {
    let num_buffers = (num_cpus::get() * 4).min(MEMORY_BUDGET / buffer_size).max(1);

    println!("\n{}", "=".repeat(80));
    println!(
        "Testing buffer_size = {} MB x {} buffers",
        buffer_size / (1024 * 1024),
        num_buffers
    );
    println!("{}", "=".repeat(80));

    let mut run_times = Vec::new();

    for i in 1..=ITERATIONS {
        let mut config = PipelineConfig::new(NUM_ROWS, PAYLOAD_SIZE, num_buffers, buffer_size);
        config.show_progress = false;
        config.seed = Some(i as u64);

        let destination = Arc::new(MemoryDestination::new().discarding());
        let report = run(
            &config,
            Target::Direct {
                destination: destination.clone(),
            },
        )
        .await?;

        if destination.rows() != NUM_ROWS as u64 {
            anyhow::bail!(
                "destination received {} rows, expected {}",
                destination.rows(),
                NUM_ROWS
            );
        }

        let duration_secs = report.elapsed.as_secs_f64();
        let throughput = (report.payload_bytes as f64 / 1024.0 / 1024.0 / 1024.0) / duration_secs;

        run_times.push(duration_secs);
        println!(
            "Run {:02}: {:.4} seconds | {:.2} GB/s | {:.0} rows/s",
            i,
            duration_secs,
            throughput,
            report.rows_per_sec()
        );
    }

    let avg_duration = run_times.iter().sum::<f64>() / ITERATIONS as f64;
    let total_gb = (NUM_ROWS as f64 * PAYLOAD_SIZE as f64) / 1024.0 / 1024.0 / 1024.0;

    println!(
        "AVERAGE: {:.4} seconds | {:.2} GB/s",
        avg_duration,
        total_gb / avg_duration
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("PIPELINE THROUGHPUT BENCHMARK");
    println!("Rows: {}", NUM_ROWS);
    println!("Payload size: {} bytes", PAYLOAD_SIZE);
    println!("Iterations: {}", ITERATIONS);
    println!();

    println!("System Configuration:");
    println!("  Physical cores: {}", num_cpus::get_physical());
    println!("  Logical CPUs: {}", num_cpus::get());
    println!();

    let buffer_sizes = vec![
        16 * 1024 * 1024,  // planner minimum
        64 * 1024 * 1024,
        256 * 1024 * 1024, // direct transport maximum
    ];

    for buffer_size in buffer_sizes {
        benchmark_buffer_size(buffer_size).await?;
    }

    println!("\n{}", "=".repeat(80));
    println!("BENCHMARK COMPLETE");
    println!("{}", "=".repeat(80));
    Ok(())
}
