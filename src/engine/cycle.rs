//! Verification cycle: generate, derive, look up, combine.

use crate::identity::derive;
use crate::oracle::BalanceOracle;
use crate::types::{Candidate, CycleOutcome, Finding};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a worker unit is within its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Idle,
    Generating,
    Deriving,
    AwaitingLookups,
    Reporting,
    Stopped,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            UnitState::Idle => "idle",
            UnitState::Generating => "generating",
            UnitState::Deriving => "deriving",
            UnitState::AwaitingLookups => "awaiting_lookups",
            UnitState::Reporting => "reporting",
            UnitState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// One generate, derive and verify unit of work. Shared by all units.
pub struct VerificationCycle {
    oracle: Arc<BalanceOracle>,
}

impl VerificationCycle {
    pub fn new(oracle: Arc<BalanceOracle>) -> Self {
        Self { oracle }
    }

    pub async fn run_once(&self) -> CycleOutcome {
        self.run_once_with(|_| {}).await
    }

    /// Run one cycle, reporting each state transition to `on_state`.
    ///
    /// Never fails: derivation errors and panics anywhere in the cycle become
    /// [`CycleOutcome::Error`].
    pub async fn run_once_with<F>(&self, on_state: F) -> CycleOutcome
    where
        F: FnMut(UnitState) + Send,
    {
        match AssertUnwindSafe(self.attempt(on_state)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!("Cycle panicked: {}", message);
                CycleOutcome::Error(format!("cycle panicked: {}", message))
            }
        }
    }

    async fn attempt<F>(&self, mut on_state: F) -> CycleOutcome
    where
        F: FnMut(UnitState) + Send,
    {
        on_state(UnitState::Generating);
        let candidate = Candidate::generate();

        on_state(UnitState::Deriving);
        let derived = tokio::task::spawn_blocking(move || {
            let identity = derive(&candidate);
            (candidate, identity)
        })
        .await;

        let (candidate, identity) = match derived {
            Ok((candidate, Ok(identity))) => (candidate, identity),
            Ok((_, Err(e))) => {
                warn!("Derivation failed: {}", e);
                return CycleOutcome::Error(e.to_string());
            }
            Err(join_err) => {
                warn!("Derivation task failed: {}", join_err);
                return CycleOutcome::Error(format!("derivation task failed: {}", join_err));
            }
        };

        on_state(UnitState::AwaitingLookups);
        debug!("Checking {}", identity.address);
        let reports = self.oracle.lookup_all(&identity).await;

        on_state(UnitState::Reporting);
        if reports.iter().any(|r| r.result.has_value()) {
            CycleOutcome::Match(Box::new(Finding::new(identity, &candidate, reports)))
        } else {
            CycleOutcome::NoMatch
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{BalanceSource, LookupError};
    use crate::types::LookupResult;
    use async_trait::async_trait;
    use nonempty::NonEmpty;
    use std::time::Duration;

    struct FixedSource(LookupResult);

    #[async_trait]
    impl BalanceSource for FixedSource {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch(&self, _address: &str) -> Result<LookupResult, LookupError> {
            Ok(self.0.clone())
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

    fn cycle_with(result: LookupResult) -> VerificationCycle {
        cycle_over(Arc::new(FixedSource(result)))
    }

    fn cycle_over(source: Arc<dyn BalanceSource>) -> VerificationCycle {
        let oracle = BalanceOracle::new(
            NonEmpty::new(source),
            Duration::from_secs(1),
            Duration::from_millis(1),
        );
        VerificationCycle::new(Arc::new(oracle))
    }

    #[tokio::test]
    async fn test_no_value_is_no_match() {
        let cycle = cycle_with(LookupResult::NoValue);
        assert_eq!(cycle.run_once().await, CycleOutcome::NoMatch);
    }

    #[tokio::test]
    async fn test_value_is_match_with_full_finding() {
        let cycle = cycle_with(LookupResult::Value {
            amount: "$10.00".to_string(),
        });

        match cycle.run_once().await {
            CycleOutcome::Match(finding) => {
                assert!(finding.address.starts_with("0x"));
                assert!(finding.entropy.len() == 32 || finding.entropy.len() == 64);
                assert_eq!(finding.reports.len(), 1);
                assert!(finding.reports[0].result.has_value());
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_state_transitions_in_order() {
        let cycle = cycle_with(LookupResult::NoValue);
        let mut states = Vec::new();

        cycle.run_once_with(|s| states.push(s)).await;

        assert_eq!(
            states,
            vec![
                UnitState::Generating,
                UnitState::Deriving,
                UnitState::AwaitingLookups,
                UnitState::Reporting,
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_source_becomes_error() {
        let cycle = cycle_over(Arc::new(PanickingSource));

        match cycle.run_once().await {
            CycleOutcome::Error(message) => assert!(message.contains("source bug")),
            other => panic!("expected error, got {:?}", other),
        }

        // Still usable afterwards.
        assert!(matches!(cycle.run_once().await, CycleOutcome::Error(_)));
    }
}
