//! Balance oracle client.
//!
//! Queries every configured source for an identity in parallel and normalizes the
//! answers. A failed or hung lookup resolves to [`LookupResult::NoValue`] after one
//! fixed backoff pause; it is never retried and never surfaced to the caller, so
//! throughput keeps advancing through source outages.

use crate::oracle::data_sources::{BalanceSource, ExplorerSource};
use crate::oracle::types::{LookupError, OracleConfig};
use crate::types::{Identity, LookupResult, SourceReport};
use anyhow::{anyhow, Result};
use futures::future::join_all;
use nonempty::NonEmpty;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Oracle client shared by every worker unit.
pub struct BalanceOracle {
    sources: NonEmpty<Arc<dyn BalanceSource>>,
    lookup_timeout: Duration,
    failure_backoff: Duration,
}

impl BalanceOracle {
    pub fn new(
        sources: NonEmpty<Arc<dyn BalanceSource>>,
        lookup_timeout: Duration,
        failure_backoff: Duration,
    ) -> Self {
        Self {
            sources,
            lookup_timeout,
            failure_backoff,
        }
    }

    /// Build explorer sources from configuration over one shared HTTP client.
    pub fn from_config(config: &OracleConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.lookup_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;

        let sources: Vec<Arc<dyn BalanceSource>> = config
            .sources
            .iter()
            .map(|source| {
                Arc::new(ExplorerSource::new(source.clone(), http_client.clone()))
                    as Arc<dyn BalanceSource>
            })
            .collect();

        let sources = NonEmpty::from_vec(sources)
            .ok_or_else(|| anyhow!("At least one lookup source is required"))?;

        info!(
            "Created balance oracle with {} sources (timeout {:?}, backoff {:?})",
            sources.len(),
            config.lookup_timeout(),
            config.failure_backoff()
        );

        Ok(Self::new(
            sources,
            config.lookup_timeout(),
            config.failure_backoff(),
        ))
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    /// Look up one identity against one source.
    #[instrument(skip(self, identity, source), fields(source = %source.name(), address = %identity.address))]
    pub async fn lookup(&self, identity: &Identity, source: &dyn BalanceSource) -> LookupResult {
        let outcome = match tokio::time::timeout(self.lookup_timeout, source.fetch(&identity.address)).await
        {
            Ok(result) => result,
            Err(_) => Err(LookupError::Timeout(self.lookup_timeout)),
        };

        match outcome {
            Ok(result) => result,
            Err(e) => {
                debug!("Lookup failed, backing off for {:?}: {}", self.failure_backoff, e);
                tokio::time::sleep(self.failure_backoff).await;
                LookupResult::NoValue
            }
        }
    }

    /// Look up one identity against every source concurrently, in configured order.
    pub async fn lookup_all(&self, identity: &Identity) -> Vec<SourceReport> {
        let lookups = self.sources.iter().map(|source| async move {
            SourceReport {
                source: source.name().to_string(),
                result: self.lookup(identity, source.as_ref()).await,
            }
        });

        join_all(lookups).await
    }
}
