//! Host resource sampling.
//!
//! CPU, memory and network figures come from `sysinfo`. Network rates are for the
//! busiest non-loopback interface between consecutive samples.

use crate::types::ResourceSample;
use std::time::{Duration, Instant};
use sysinfo::{Networks, System};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Source of host metrics.
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> ResourceSample;
}

/// `sysinfo` backed sampler.
pub struct SystemSampler {
    system: System,
    networks: Networks,
    last_refresh: Instant,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta, so the first refresh only primes it.
        system.refresh_cpu_usage();

        Self {
            system,
            networks: Networks::new_with_refreshed_list(),
            last_refresh: Instant::now(),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&mut self) -> ResourceSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.networks.refresh(true);

        let now = Instant::now();
        let secs = now.duration_since(self.last_refresh).as_secs_f64();
        self.last_refresh = now;

        let (rx, tx) = busiest_interface(
            self.networks
                .list()
                .iter()
                .map(|(name, data)| (name.as_str(), data.received(), data.transmitted())),
        );

        ResourceSample {
            net_rx: kb_per_sec(rx, secs),
            net_tx: kb_per_sec(tx, secs),
            cpu: round2(f64::from(self.system.global_cpu_usage())),
            ram: percent(self.system.used_memory(), self.system.total_memory()),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(used.min(total) as f64 / total as f64 * 100.0)
}

fn kb_per_sec(bytes: u64, secs: f64) -> f64 {
    if secs <= 0.0 {
        return 0.0;
    }
    round2(bytes as f64 / 1024.0 / secs)
}

/// Received and transmitted bytes of the non-loopback interface that received most.
fn busiest_interface<'a>(interfaces: impl Iterator<Item = (&'a str, u64, u64)>) -> (u64, u64) {
    interfaces
        .filter(|(name, _, _)| *name != "lo" && !name.starts_with("lo0"))
        .map(|(_, rx, tx)| (rx, tx))
        .max_by_key(|(rx, _)| *rx)
        .unwrap_or((0, 0))
}

/// Periodically sample and forward results to the aggregator until stopped.
pub async fn run_sampler<S: ResourceSampler>(
    mut sampler: S,
    interval: Duration,
    sample_tx: mpsc::Sender<ResourceSample>,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!("Resource sampler running every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sample = sampler.sample();
                debug!(?sample, "Resource sample");
                if sample_tx.send(sample).await.is_err() {
                    break;
                }
            }
            _ = stop_rx.changed() => break,
        }
    }

    debug!("Resource sampler stopped");
}
