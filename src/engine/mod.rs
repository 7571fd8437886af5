//! Engine module - the concurrent generate and verify pipeline.
//!
//! Units in the [`WorkerPool`] run [`VerificationCycle`]s and send one outcome per
//! cycle to the [`StatsAggregator`], which owns the counters and drives the
//! [`Recorder`]. Everything else reads snapshots.

pub mod config;
pub mod cycle;
pub mod pool;
pub mod aggregator;
pub mod recorder;
pub mod sampler;
pub mod status;

// Re-export main types
pub use config::{EngineBuilder, EngineConfig};
pub use cycle::{UnitState, VerificationCycle};
pub use pool::{ExitReason, UnitExit, WorkerPool};
pub use aggregator::{AggregatorConfig, StatsAggregator};
pub use recorder::{load_snapshot, FileRecorder, Recorder, RecorderError};
pub use sampler::{SystemSampler, ResourceSampler};

use crate::oracle::BalanceOracle;
use crate::types::Stats;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

/// Result of a full engine run.
#[derive(Debug, Clone)]
pub struct EngineReport {
    pub stats: Stats,
    pub exits: Vec<UnitExit>,
}

/// Running engine: pool, aggregator and sampler.
pub struct Engine {
    pool: WorkerPool,
    aggregator: JoinHandle<Stats>,
    sampler: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    snapshot_rx: watch::Receiver<Stats>,
}

impl Engine {
    /// Start with file persistence, explorer sources and the host sampler.
    pub async fn start(config: &EngineConfig) -> Result<Self> {
        let oracle = BalanceOracle::from_config(&config.oracle)
            .context("Failed to build balance oracle")?;
        let recorder = FileRecorder::new(&config.findings_path, &config.stats_path)
            .with_append_attempts(config.append_attempts);
        let initial = load_snapshot(&config.stats_path).await;

        Self::start_with(
            config,
            Arc::new(oracle),
            Arc::new(recorder),
            initial,
            SystemSampler::new(),
        )
    }

    /// Start with explicit collaborators.
    pub fn start_with<S>(
        config: &EngineConfig,
        oracle: Arc<BalanceOracle>,
        recorder: Arc<dyn Recorder>,
        initial: Stats,
        sampler: S,
    ) -> Result<Self>
    where
        S: ResourceSampler + 'static,
    {
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (sample_tx, sample_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = watch::channel(false);

        let (aggregator, snapshot_rx) = StatsAggregator::new(
            initial,
            recorder,
            AggregatorConfig {
                window: config.window(),
                persist_interval: config.persist_interval(),
            },
        );

        let cycle = Arc::new(VerificationCycle::new(oracle));
        let pool = WorkerPool::start(config.workers, cycle, event_tx, config.stop_grace())?;

        let aggregator = tokio::spawn(aggregator.run(event_rx, sample_rx, shutdown_tx.subscribe()));
        let sampler = tokio::spawn(sampler::run_sampler(
            sampler,
            config.sample_interval(),
            sample_tx,
            shutdown_tx.subscribe(),
        ));

        info!("Engine started with {} workers", config.workers);

        Ok(Self {
            pool,
            aggregator,
            sampler,
            shutdown_tx,
            snapshot_rx,
        })
    }

    /// Read-only view of the latest stats.
    pub fn snapshots(&self) -> watch::Receiver<Stats> {
        self.snapshot_rx.clone()
    }

    /// Receiver that flips to `true` once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop units first, then let the aggregator drain and write its final snapshot.
    pub async fn stop(mut self) -> Result<EngineReport> {
        let exits = self.pool.stop().await;
        self.shutdown_tx.send_replace(true);

        let stats = self.aggregator.await.context("Aggregator task failed")?;
        self.sampler.await.context("Sampler task failed")?;

        Ok(EngineReport { stats, exits })
    }
}
