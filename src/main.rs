//! Demo driver: simulates a chunked upload through the runner.
//!
//! Config comes from the `SLOT_RUNNER_*` variables (see `RunnerConfig::from_env`).
//! `SLOT_RUNNER_DEMO_BYTES` sets the simulated file size. Ctrl-C cancels.

use std::time::Duration;

use slot_runner::{JobSource, RunEvent, Runner, RunnerConfig, labeled};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE_BYTES: u64 = 512 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RunnerConfig::from_env()?;

    let total_bytes: u64 = std::env::var("SLOT_RUNNER_DEMO_BYTES")
        .unwrap_or_else(|_| (64 * 1024 * 1024).to_string())
        .parse()
        .unwrap_or(64 * 1024 * 1024);
    let n_chunks = total_bytes.div_ceil(CHUNK_SIZE_BYTES);

    eprintln!("slot-runner v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Slots: {}", config.concurrency);
    eprintln!("   Policy: {}", config.failure_policy);
    eprintln!("   Chunks: {} x {} KiB\n", n_chunks, CHUNK_SIZE_BYTES / 1024);

    let runner = Runner::new(config)?;

    // Progress reporting from the event stream.
    let mut events = runner.subscribe();
    let progress = tokio::spawn(async move {
        let mut done = 0u64;
        loop {
            match events.recv().await {
                Ok(RunEvent::JobCompleted { .. } | RunEvent::JobFailed { .. }) => {
                    done += 1;
                    eprint!("\r   Progress: {:>3}%", (100 * done) / n_chunks.max(1));
                }
                Ok(RunEvent::RunFinished { .. }) | Err(RecvError::Closed) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
        eprintln!();
    });

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight chunks");
            on_ctrl_c.cancel();
        }
    });

    let source = JobSource::from_jobs((0..n_chunks).map(|i| {
        labeled(format!("chunk {i}"), move || async move {
            // Chunks that would be all zeros are skipped without a request.
            if i % 7 == 3 {
                return Ok(());
            }
            let latency = 5 + (i * 37) % 40;
            tokio::time::sleep(Duration::from_millis(latency)).await;
            anyhow::Ok(())
        })
    }));

    let completion = runner.run_with_cancel(source, cancel).await;
    let _ = progress.await;

    println!("{}", serde_json::to_string_pretty(&completion.stats)?);
    for failure in &completion.failures {
        eprintln!("   {failure}");
    }

    completion.into_result()?;
    Ok(())
}
