//! Periodic status line built from the latest stats snapshot.

use crate::types::Stats;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// One-line rendering of a snapshot.
pub fn format_status(stats: &Stats) -> String {
    format!(
        "Success: {} | Failed: {} | Tries/min: {} | Net RX: {:.2} KB/s | Net TX: {:.2} KB/s | CPU: {:.2}% | RAM: {:.2}%",
        stats.success, stats.fail, stats.tries_per_min, stats.net_rx, stats.net_tx, stats.cpu, stats.ram
    )
}

/// Log the current snapshot every `interval` until the stop signal flips.
pub async fn run_status_reporter(
    snapshot_rx: watch::Receiver<Stats>,
    interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = *snapshot_rx.borrow();
                info!("{}", format_status(&stats));
            }
            _ = stop_rx.changed() => break,
        }
    }
}
