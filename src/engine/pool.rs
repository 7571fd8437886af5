//! Worker pool running verification cycles in parallel.
//!
//! Every unit is an independent task looping over cycles forever. The only coupling
//! to the rest of the system is the outcome channel: each completed cycle sends
//! exactly one [`CycleEvent`].

use crate::engine::cycle::{UnitState, VerificationCycle};
use crate::types::CycleEvent;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{Id, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// How a unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Observed the stop signal
    Stopped,
    /// The aggregator is gone
    ChannelClosed,
    /// The unit task panicked
    Crashed(String),
    /// Did not finish within the stop grace period
    Aborted,
}

/// Final report for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitExit {
    pub unit: usize,
    pub cycles: u64,
    pub reason: ExitReason,
}

/// Fixed pool of worker units.
pub struct WorkerPool {
    units: JoinSet<UnitExit>,
    unit_ids: Vec<(Id, usize)>,
    stop_tx: watch::Sender<bool>,
    stop_grace: Duration,
    exits: Option<Vec<UnitExit>>,
}

impl WorkerPool {
    /// Launch `worker_count` units. The pool keeps no sender of its own, so the
    /// outcome channel closes once every unit has exited.
    pub fn start(
        worker_count: usize,
        cycle: Arc<VerificationCycle>,
        outcome_tx: mpsc::Sender<CycleEvent>,
        stop_grace: Duration,
    ) -> Result<Self> {
        if worker_count == 0 {
            return Err(anyhow!("Worker count must be greater than zero"));
        }

        let (stop_tx, _) = watch::channel(false);
        let mut units = JoinSet::new();
        let mut unit_ids = Vec::with_capacity(worker_count);

        for unit in 0..worker_count {
            let handle = units.spawn(run_unit(
                unit,
                cycle.clone(),
                outcome_tx.clone(),
                stop_tx.subscribe(),
            ));
            unit_ids.push((handle.id(), unit));
        }
        drop(outcome_tx);

        info!("Worker pool started with {} units", worker_count);

        Ok(Self {
            units,
            unit_ids,
            stop_tx,
            stop_grace,
            exits: None,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.unit_ids.len()
    }

    /// Receiver that flips to `true` when the pool is stopped.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Wait for the next unit to exit on its own, e.g. after a crash.
    ///
    /// Returns `None` once every unit has been reaped.
    pub async fn next_exit(&mut self) -> Option<UnitExit> {
        let joined = self.units.join_next_with_id().await?;
        let exit = self.reap(joined);
        Some(exit)
    }

    /// Signal every unit to stop and wait for them.
    ///
    /// Units still running after the grace period are aborted. Calling `stop` again
    /// returns the same reports.
    pub async fn stop(&mut self) -> Vec<UnitExit> {
        if let Some(exits) = &self.exits {
            return exits.clone();
        }

        info!("Stopping worker pool ({} units)", self.worker_count());
        self.stop_tx.send_replace(true);

        let mut exits = Vec::with_capacity(self.worker_count());
        let deadline = tokio::time::sleep(self.stop_grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = self.units.join_next_with_id() => match joined {
                    Some(joined) => exits.push(self.reap(joined)),
                    None => break,
                },
                _ = &mut deadline => {
                    warn!("Stop grace period elapsed, aborting {} units", self.units.len());
                    self.units.abort_all();
                    while let Some(joined) = self.units.join_next_with_id().await {
                        exits.push(self.reap(joined));
                    }
                    break;
                }
            }
        }

        exits.sort_by_key(|e| e.unit);
        let total: u64 = exits.iter().map(|e| e.cycles).sum();
        info!("Worker pool stopped after {} cycles", total);

        self.exits = Some(exits.clone());
        exits
    }

    fn unit_for(&self, id: Id) -> usize {
        self.unit_ids
            .iter()
            .find(|(task_id, _)| *task_id == id)
            .map(|(_, unit)| *unit)
            .unwrap_or(usize::MAX)
    }

    fn reap(&self, joined: Result<(Id, UnitExit), tokio::task::JoinError>) -> UnitExit {
        match joined {
            Ok((_, exit)) => exit,
            Err(join_err) => {
                let unit = self.unit_for(join_err.id());
                if join_err.is_cancelled() {
                    UnitExit {
                        unit,
                        cycles: 0,
                        reason: ExitReason::Aborted,
                    }
                } else {
                    error!("Worker unit {} crashed: {}", unit, join_err);
                    UnitExit {
                        unit,
                        cycles: 0,
                        reason: ExitReason::Crashed(join_err.to_string()),
                    }
                }
            }
        }
    }
}

/// Unit loop. Cycles run strictly one after another; the stop signal is observed
/// between cycles and while a cycle is in flight.
async fn run_unit(
    unit: usize,
    cycle: Arc<VerificationCycle>,
    outcome_tx: mpsc::Sender<CycleEvent>,
    mut stop_rx: watch::Receiver<bool>,
) -> UnitExit {
    let mut cycles = 0u64;
    let mut state = UnitState::Idle;
    debug!("Worker unit {} {}", unit, state);

    let reason = loop {
        if *stop_rx.borrow() {
            break ExitReason::Stopped;
        }

        let outcome = tokio::select! {
            biased;
            _ = stop_rx.changed() => break ExitReason::Stopped,
            outcome = cycle.run_once_with(|s| {
                trace!("Worker unit {} {}", unit, s);
            }) => outcome,
        };
        state = UnitState::Reporting;

        // A finished cycle is always reported if the channel has room; only a send
        // blocked on a full channel gives way to the stop signal.
        let event = CycleEvent { unit, outcome };
        match outcome_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => break ExitReason::ChannelClosed,
            Err(TrySendError::Full(event)) => {
                let sent = tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break ExitReason::Stopped,
                    sent = outcome_tx.send(event) => sent,
                };
                if sent.is_err() {
                    break ExitReason::ChannelClosed;
                }
            }
        }
        cycles += 1;
    };

    state = match reason {
        ExitReason::Stopped => UnitState::Stopped,
        _ => state,
    };
    debug!("Worker unit {} {} after {} cycles ({:?})", unit, state, cycles, reason);

    UnitExit {
        unit,
        cycles,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{BalanceOracle, BalanceSource, LookupError};
    use crate::types::{CycleOutcome, LookupResult};
    use async_trait::async_trait;
    use nonempty::NonEmpty;

    struct SlowSource(Duration);

    #[async_trait]
    impl BalanceSource for SlowSource {
        fn name(&self) -> &str {
            "slow"
        }

        async fn fetch(&self, _address: &str) -> Result<LookupResult, LookupError> {
            tokio::time::sleep(self.0).await;
            Ok(LookupResult::NoValue)
        }
    }

    struct PanickingSource;

    #[async_trait]
    impl BalanceSource for PanickingSource {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn fetch(&self, _address: &str) -> Result<LookupResult, LookupError> {
            panic!("source bug")
        }
    }

    /// Flips the unit's stop signal while answering, so the cycle completes after stop.
    struct StoppingSource(watch::Sender<bool>);

    #[async_trait]
    impl BalanceSource for StoppingSource {
        fn name(&self) -> &str {
            "stopping"
        }

        async fn fetch(&self, _address: &str) -> Result<LookupResult, LookupError> {
            self.0.send_replace(true);
            Ok(LookupResult::NoValue)
        }
    }

    fn cycle(delay: Duration) -> Arc<VerificationCycle> {
        cycle_over(Arc::new(SlowSource(delay)))
    }

    fn cycle_over(source: Arc<dyn BalanceSource>) -> Arc<VerificationCycle> {
        let oracle = BalanceOracle::new(
            NonEmpty::new(source),
            Duration::from_secs(60),
            Duration::from_millis(1),
        );
        Arc::new(VerificationCycle::new(Arc::new(oracle)))
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(WorkerPool::start(0, cycle(Duration::ZERO), tx, Duration::from_secs(1)).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_units_report_and_stop() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut pool =
            WorkerPool::start(3, cycle(Duration::from_millis(1)), tx, Duration::from_secs(2)).unwrap();

        let mut seen_units = std::collections::HashSet::new();
        while seen_units.len() < 3 {
            let event = rx.recv().await.unwrap();
            seen_units.insert(event.unit);
        }

        let exits = pool.stop().await;
        assert_eq!(exits.len(), 3);
        assert!(exits.iter().all(|e| e.reason == ExitReason::Stopped));

        // Channel drains and closes once every unit is gone.
        while rx.recv().await.is_some() {}

        // Idempotent.
        assert_eq!(pool.stop().await, exits);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_interrupts_in_flight_cycle() {
        let (tx, _rx) = mpsc::channel(8);
        let mut pool =
            WorkerPool::start(2, cycle(Duration::from_secs(3600)), tx, Duration::from_secs(5)).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = std::time::Instant::now();
        let exits = pool.stop().await;

        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(exits.iter().all(|e| e.reason == ExitReason::Stopped && e.cycles == 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_closed_channel_ends_units() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut pool =
            WorkerPool::start(2, cycle(Duration::ZERO), tx, Duration::from_secs(1)).unwrap();

        let first = pool.next_exit().await.unwrap();
        assert_eq!(first.reason, ExitReason::ChannelClosed);
        let second = pool.next_exit().await.unwrap();
        assert_eq!(second.reason, ExitReason::ChannelClosed);
        assert!(pool.next_exit().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_cycle_keeps_unit_alive() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut pool =
            WorkerPool::start(1, cycle_over(Arc::new(PanickingSource)), tx, Duration::from_secs(2))
                .unwrap();

        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.unit, 0);
            assert!(matches!(event.outcome, CycleOutcome::Error(ref m) if m.contains("source bug")));
        }

        let exits = pool.stop().await;
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].reason, ExitReason::Stopped);
        assert!(exits[0].cycles >= 3);
    }

    #[tokio::test]
    async fn test_completed_cycle_reported_despite_stop() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::channel(8);
        let cycle = cycle_over(Arc::new(StoppingSource(stop_tx)));

        let exit = run_unit(0, cycle, tx, stop_rx).await;

        assert_eq!(exit.reason, ExitReason::Stopped);
        assert_eq!(exit.cycles, 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.outcome, CycleOutcome::NoMatch);
        assert!(rx.recv().await.is_none());
    }
}
