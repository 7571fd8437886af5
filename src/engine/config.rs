//! Engine configuration and builder.

use crate::oracle::{OracleConfig, SourceConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of parallel worker units
    pub workers: usize,
    /// Capacity of the outcome channel between units and the aggregator
    pub channel_capacity: usize,
    /// Throughput window in seconds
    pub window_seconds: u64,
    /// Snapshot persistence interval in seconds
    pub persist_seconds: u64,
    /// Resource sampling interval in milliseconds
    pub sample_interval_ms: u64,
    /// Status report interval in milliseconds
    pub status_interval_ms: u64,
    /// How long stop waits for units before aborting them, in milliseconds
    pub stop_grace_ms: u64,
    /// Stats snapshot file
    pub stats_path: PathBuf,
    /// Append-only findings log
    pub findings_path: PathBuf,
    /// Total attempts for a finding append
    pub append_attempts: usize,
    pub oracle: OracleConfig,
}

impl EngineConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_seconds)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            channel_capacity: 1024,
            window_seconds: 60,
            persist_seconds: 300,
            sample_interval_ms: 1000,
            status_interval_ms: 5000,
            stop_grace_ms: 2000,
            stats_path: PathBuf::from("stats.json"),
            findings_path: PathBuf::from("wallets.jsonl"),
            append_attempts: 3,
            oracle: OracleConfig::default(),
        }
    }
}

/// Builder for convenient construction with sensible defaults.
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity.max(1);
        self
    }

    /// Set throughput window and snapshot persistence intervals.
    pub fn with_intervals(mut self, window_seconds: u64, persist_seconds: u64) -> Self {
        self.config.window_seconds = window_seconds.max(1);
        self.config.persist_seconds = persist_seconds.max(1);
        self
    }

    pub fn with_status_interval(mut self, interval_ms: u64) -> Self {
        self.config.status_interval_ms = interval_ms.max(1);
        self
    }

    pub fn with_stop_grace(mut self, grace_ms: u64) -> Self {
        self.config.stop_grace_ms = grace_ms;
        self
    }

    pub fn with_paths(mut self, stats_path: PathBuf, findings_path: PathBuf) -> Self {
        self.config.stats_path = stats_path;
        self.config.findings_path = findings_path;
        self
    }

    /// Set lookup timeout (seconds) and failure backoff (milliseconds).
    pub fn with_lookup_timing(mut self, timeout_seconds: u64, backoff_ms: u64) -> Self {
        self.config.oracle.lookup_timeout_seconds = timeout_seconds.max(1);
        self.config.oracle.failure_backoff_ms = backoff_ms;
        self
    }

    pub fn with_sources(mut self, sources: Vec<SourceConfig>) -> Self {
        self.config.oracle.sources = sources;
        self
    }

    pub fn build_config(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
