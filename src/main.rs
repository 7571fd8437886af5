//! Main entry point for seedprobe.

use anyhow::{Context, Result};
use clap::Parser;
use seedprobe::engine::{status, Engine, EngineBuilder, ExitReason};
use std::path::PathBuf;
use tracing::{error, info, warn, Level};

/// Generate candidates and check them against block explorers.
#[derive(Debug, Parser)]
#[command(name = "seedprobe", version)]
struct Args {
    /// Number of parallel worker units
    workers: usize,

    /// Stats snapshot file
    #[arg(long, default_value = "stats.json")]
    stats: PathBuf,

    /// Append-only findings log
    #[arg(long, default_value = "wallets.jsonl")]
    findings: PathBuf,

    /// Per-lookup timeout in seconds
    #[arg(long, default_value_t = 15)]
    lookup_timeout: u64,

    /// Pause after a failed lookup in milliseconds
    #[arg(long, default_value_t = 10_000)]
    backoff_ms: u64,

    /// Throughput window in seconds
    #[arg(long, default_value_t = 60)]
    window: u64,

    /// Snapshot interval in seconds
    #[arg(long, default_value_t = 300)]
    persist: u64,

    /// Status line interval in milliseconds
    #[arg(long, default_value_t = 5000)]
    status_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    if args.workers == 0 {
        anyhow::bail!("Usage: seedprobe <number_of_workers> (must be greater than zero)");
    }

    let config = EngineBuilder::new()
        .with_workers(args.workers)
        .with_paths(args.stats, args.findings)
        .with_lookup_timing(args.lookup_timeout, args.backoff_ms)
        .with_intervals(args.window, args.persist)
        .with_status_interval(args.status_ms)
        .build_config();

    info!("Starting with {} workers", config.workers);

    let engine = Engine::start(&config).await?;

    let reporter = tokio::spawn(status::run_status_reporter(
        engine.snapshots(),
        config.status_interval(),
        engine.shutdown_signal(),
    ));

    wait_for_shutdown().await?;
    info!("Shutting down...");

    let report = engine.stop().await?;
    if let Err(e) = reporter.await {
        warn!("Status reporter task failed: {}", e);
    }

    for exit in &report.exits {
        if let ExitReason::Crashed(reason) = &exit.reason {
            error!("Worker {} stopped with error: {}", exit.unit, reason);
        } else if exit.reason == ExitReason::Aborted {
            warn!("Worker {} was aborted", exit.unit);
        }
    }
    info!("{}", status::format_status(&report.stats));

    Ok(())
}

/// Resolve on Ctrl-C or, on unix, SIGTERM.
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term_signal =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
            _ = term_signal.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    Ok(())
}
