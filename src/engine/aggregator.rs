//! Event aggregator - the single owner of [`Stats`].
//!
//! Drains cycle outcomes from every unit in arrival order, keeps the running
//! counters, rolls the throughput window and persists snapshots. Readers get copies
//! through a `watch` channel and never touch the live counters.

use crate::engine::recorder::Recorder;
use crate::types::{CycleEvent, CycleOutcome, ResourceSample, Stats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Aggregator timing.
#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    /// Throughput window length
    pub window: Duration,
    /// Snapshot persistence interval
    pub persist_interval: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            persist_interval: Duration::from_secs(300),
        }
    }
}

/// Single consumer of cycle events.
pub struct StatsAggregator {
    stats: Stats,
    recorder: Arc<dyn Recorder>,
    snapshot_tx: watch::Sender<Stats>,
    config: AggregatorConfig,
}

impl StatsAggregator {
    /// Create an aggregator starting from `initial` (usually the loaded snapshot).
    ///
    /// Returns the aggregator and a receiver for read-only snapshots.
    pub fn new(
        initial: Stats,
        recorder: Arc<dyn Recorder>,
        config: AggregatorConfig,
    ) -> (Self, watch::Receiver<Stats>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        (
            Self {
                stats: initial,
                recorder,
                snapshot_tx,
                config,
            },
            snapshot_rx,
        )
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Additional snapshot reader.
    pub fn subscribe(&self) -> watch::Receiver<Stats> {
        self.snapshot_tx.subscribe()
    }

    /// Count one cycle. A match is appended to the findings log first; a failed
    /// append is logged and the cycle still counts.
    pub async fn handle_event(&mut self, event: CycleEvent) {
        match &event.outcome {
            CycleOutcome::Match(finding) => {
                info!("WINNER FOUND: {} (unit {})", finding.address, event.unit);
                if let Err(e) = self.recorder.append_finding(finding).await {
                    error!(
                        "Failed to record finding for {}: {}. Finding: {:?}",
                        finding.address, e, finding
                    );
                }
            }
            CycleOutcome::NoMatch => {}
            CycleOutcome::Error(message) => {
                warn!("Cycle error on unit {}: {}", event.unit, message);
            }
        }

        self.stats.record(&event.outcome);
        self.publish();
    }

    pub fn handle_sample(&mut self, sample: ResourceSample) {
        self.stats.apply_sample(&sample);
        self.publish();
    }

    /// Close the throughput window. Returns the completed window's count.
    pub fn roll_window(&mut self) -> u64 {
        let tries = self.stats.roll_window();
        debug!("Throughput window closed: {} tries", tries);
        self.publish();
        tries
    }

    /// Write the current stats to durable storage. Failures are logged only; the
    /// in-memory counters stay authoritative.
    pub async fn persist(&self) -> bool {
        match self.recorder.write_snapshot(&self.stats).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to persist stats snapshot: {}", e);
                false
            }
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.stats);
    }

    /// Main loop. Ends when `stop_rx` flips to `true` or every event sender is gone,
    /// after draining buffered events and writing exactly one final snapshot.
    pub async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<CycleEvent>,
        mut sample_rx: mpsc::Receiver<ResourceSample>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Stats {
        info!(
            "Aggregator running (window {:?}, persist every {:?})",
            self.config.window, self.config.persist_interval
        );

        let mut window_tick = interval_at(Instant::now() + self.config.window, self.config.window);
        window_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut persist_tick = interval_at(
            Instant::now() + self.config.persist_interval,
            self.config.persist_interval,
        );
        persist_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut samples_open = true;

        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("All event senders closed");
                        break;
                    }
                },
                sample = sample_rx.recv(), if samples_open => match sample {
                    Some(sample) => self.handle_sample(sample),
                    None => samples_open = false,
                },
                _ = window_tick.tick() => {
                    self.roll_window();
                }
                _ = persist_tick.tick() => {
                    self.persist().await;
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Units may have reported just before stopping.
        while let Ok(event) = event_rx.try_recv() {
            self.handle_event(event).await;
        }

        if self.persist().await {
            info!("Final stats snapshot written");
        }
        info!(
            "Aggregator stopped: {} success, {} failed, {} total",
            self.stats.success, self.stats.fail, self.stats.total_tries
        );
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::recorder::RecorderError;
    use crate::types::{Finding, LookupResult, SourceReport};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryRecorder {
        findings: Mutex<Vec<Finding>>,
        snapshots: Mutex<Vec<Stats>>,
        fail_appends: bool,
    }

    #[async_trait]
    impl Recorder for MemoryRecorder {
        async fn append_finding(&self, finding: &Finding) -> Result<(), RecorderError> {
            if self.fail_appends {
                return Err(RecorderError::Serialize(
                    serde_json::from_str::<u8>("x").unwrap_err(),
                ));
            }
            self.findings.lock().unwrap().push(finding.clone());
            Ok(())
        }

        async fn write_snapshot(&self, stats: &Stats) -> Result<(), RecorderError> {
            self.snapshots.lock().unwrap().push(*stats);
            Ok(())
        }
    }

    fn finding() -> Finding {
        Finding {
            address: "0xfeed".to_string(),
            mnemonic: "m".to_string(),
            entropy: "00".to_string(),
            secret_key: "0x01".to_string(),
            reports: vec![SourceReport {
                source: "etherscan".to_string(),
                result: LookupResult::Value {
                    amount: "$1.00".to_string(),
                },
            }],
            timestamp: Utc::now(),
        }
    }

    fn event(outcome: CycleOutcome) -> CycleEvent {
        CycleEvent { unit: 0, outcome }
    }

    fn long_intervals() -> AggregatorConfig {
        AggregatorConfig {
            window: Duration::from_secs(3600),
            persist_interval: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_counters_stay_consistent() {
        let recorder = Arc::new(MemoryRecorder::default());
        let (mut aggregator, snapshots) =
            StatsAggregator::new(Stats::default(), recorder.clone(), long_intervals());

        let outcomes = vec![
            CycleOutcome::NoMatch,
            CycleOutcome::Error("boom".to_string()),
            CycleOutcome::Match(Box::new(finding())),
            CycleOutcome::NoMatch,
        ];
        for outcome in outcomes {
            aggregator.handle_event(event(outcome)).await;
            let snapshot = *snapshots.borrow();
            assert!(snapshot.is_consistent());
        }

        let stats = aggregator.stats();
        assert_eq!(stats.success, 1);
        assert_eq!(stats.fail, 3);
        assert_eq!(stats.total_tries, 4);
        assert_eq!(recorder.findings.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_append_still_counts() {
        let recorder = Arc::new(MemoryRecorder {
            fail_appends: true,
            ..Default::default()
        });
        let (mut aggregator, _) =
            StatsAggregator::new(Stats::default(), recorder, long_intervals());

        aggregator
            .handle_event(event(CycleOutcome::Match(Box::new(finding()))))
            .await;

        assert_eq!(aggregator.stats().success, 1);
        assert!(aggregator.stats().is_consistent());
    }

    #[tokio::test]
    async fn test_window_roll_counts_prior_window_only() {
        let recorder = Arc::new(MemoryRecorder::default());
        let (mut aggregator, snapshots) =
            StatsAggregator::new(Stats::default(), recorder, long_intervals());

        for _ in 0..5 {
            aggregator.handle_event(event(CycleOutcome::NoMatch)).await;
        }
        assert_eq!(aggregator.roll_window(), 5);
        assert_eq!(snapshots.borrow().tries, 0);
        assert_eq!(snapshots.borrow().tries_per_min, 5);

        for _ in 0..2 {
            aggregator.handle_event(event(CycleOutcome::NoMatch)).await;
        }
        assert_eq!(aggregator.roll_window(), 2);
        assert_eq!(aggregator.stats().total_tries, 7);
    }

    #[tokio::test]
    async fn test_resource_samples_merge_into_snapshot() {
        let recorder = Arc::new(MemoryRecorder::default());
        let (mut aggregator, snapshots) =
            StatsAggregator::new(Stats::default(), recorder, long_intervals());

        aggregator.handle_sample(ResourceSample {
            net_rx: 10.0,
            net_tx: 5.0,
            cpu: 33.3,
            ram: 50.0,
        });

        let snapshot = *snapshots.borrow();
        assert_eq!(snapshot.cpu, 33.3);
        assert_eq!(snapshot.net_tx, 5.0);
        assert_eq!(snapshot.total_tries, 0);
    }

    #[tokio::test]
    async fn test_run_writes_one_final_snapshot_on_stop() {
        let recorder = Arc::new(MemoryRecorder::default());
        let (aggregator, _) =
            StatsAggregator::new(Stats::default(), recorder.clone(), long_intervals());
        let (event_tx, event_rx) = mpsc::channel(16);
        let (_sample_tx, sample_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(aggregator.run(event_rx, sample_rx, stop_rx));

        for _ in 0..3 {
            event_tx.send(event(CycleOutcome::NoMatch)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(true).unwrap();

        let stats = handle.await.unwrap();
        assert_eq!(stats.fail, 3);

        let snapshots = recorder.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].fail, 3);
    }

    #[tokio::test]
    async fn test_run_ends_when_senders_close() {
        let recorder = Arc::new(MemoryRecorder::default());
        let initial = Stats {
            success: 2,
            fail: 8,
            total_tries: 10,
            ..Default::default()
        };
        let (aggregator, _) = StatsAggregator::new(initial, recorder.clone(), long_intervals());
        let (event_tx, event_rx) = mpsc::channel(16);
        let (_sample_tx, sample_rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = watch::channel(false);

        event_tx.send(event(CycleOutcome::NoMatch)).await.unwrap();
        drop(event_tx);

        let stats = aggregator.run(event_rx, sample_rx, stop_rx).await;
        assert_eq!(stats.fail, 9);
        assert_eq!(stats.total_tries, 11);
        assert_eq!(recorder.snapshots.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_rolls_window_and_persists_on_timers() {
        let recorder = Arc::new(MemoryRecorder::default());
        let config = AggregatorConfig {
            window: Duration::from_millis(40),
            persist_interval: Duration::from_millis(60),
        };
        let (aggregator, snapshots) =
            StatsAggregator::new(Stats::default(), recorder.clone(), config);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (_sample_tx, sample_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(aggregator.run(event_rx, sample_rx, stop_rx));
        for _ in 0..4 {
            event_tx.send(event(CycleOutcome::NoMatch)).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        let seen = *snapshots.borrow();
        assert_eq!(seen.tries, 0);
        assert_eq!(seen.total_tries, 4);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        // At least one timed write plus the final one.
        assert!(recorder.snapshots.lock().unwrap().len() >= 2);
    }
}
