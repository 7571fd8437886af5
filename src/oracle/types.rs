//! Configuration and error types for the balance oracle.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// How to pull the displayed amount out of a source's address page.
///
/// The page is scanned from the first occurrence of `anchor`, then from the first
/// occurrence of `label` after it. Markup is stripped and the `line_offset`-th
/// non-empty text line is taken as the amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub anchor: String,
    pub label: String,
    pub line_offset: usize,
}

/// A single lookup source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Display name, also used in findings
    pub name: String,
    /// URL with an `{address}` placeholder
    pub url_template: String,
    pub rule: ExtractionRule,
}

impl SourceConfig {
    /// A Blockscan-family explorer (etherscan, bscscan, ...).
    pub fn blockscan(name: &str, host: &str, currency: &str) -> Self {
        Self {
            name: name.to_string(),
            url_template: format!("https://{}/address/{{address}}", host),
            rule: ExtractionRule {
                anchor: "ContentPlaceHolder1_divSummary".to_string(),
                label: format!("{} Value", currency),
                line_offset: 0,
            },
        }
    }

    pub fn url_for(&self, address: &str) -> String {
        self.url_template.replace("{address}", address)
    }
}

/// Oracle client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Sources queried for every identity
    pub sources: Vec<SourceConfig>,
    /// Upper bound for a single lookup in seconds
    pub lookup_timeout_seconds: u64,
    /// Pause after a failed lookup in milliseconds
    pub failure_backoff_ms: u64,
    /// User agent sent with every request
    pub user_agent: String,
}

impl OracleConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_seconds)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            sources: vec![
                SourceConfig::blockscan("etherscan", "etherscan.io", "ETH"),
                SourceConfig::blockscan("bscscan", "bscscan.com", "BNB"),
            ],
            lookup_timeout_seconds: 15,
            failure_backoff_ms: 10_000,
            user_agent: concat!("seedprobe/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Reasons a lookup produced no usable answer. Never leaves the oracle client.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("source answered with status {0}")]
    Status(u16),
    #[error("value not found in response")]
    Extraction,
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),
}
