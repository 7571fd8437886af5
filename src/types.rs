//! Core types and data structures for the seedprobe engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported entropy sizes for a candidate seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntropySize {
    /// 128 bits, encodes to a 12-word mnemonic
    Bits128,
    /// 256 bits, encodes to a 24-word mnemonic
    Bits256,
}

impl EntropySize {
    /// Number of entropy bytes for this size.
    pub fn byte_len(&self) -> usize {
        match self {
            EntropySize::Bits128 => 16,
            EntropySize::Bits256 => 32,
        }
    }

    /// Number of words in the mnemonic encoding.
    pub fn word_count(&self) -> usize {
        match self {
            EntropySize::Bits128 => 12,
            EntropySize::Bits256 => 24,
        }
    }

    pub fn from_byte_len(len: usize) -> Option<Self> {
        match len {
            16 => Some(EntropySize::Bits128),
            32 => Some(EntropySize::Bits256),
            _ => None,
        }
    }
}

/// A random seed value. Created fresh per cycle and never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    entropy: Vec<u8>,
}

impl Candidate {
    /// Wrap raw entropy bytes. Only 16 and 32 byte inputs are well-formed.
    pub fn from_entropy(entropy: Vec<u8>) -> Self {
        Self { entropy }
    }

    pub fn entropy(&self) -> &[u8] {
        &self.entropy
    }

    pub fn size(&self) -> Option<EntropySize> {
        EntropySize::from_byte_len(self.entropy.len())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.entropy)
    }
}

/// Public identity and secret material derived from a [`Candidate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// EIP-55 checksummed address
    pub address: String,
    /// 0x-prefixed hex secret key
    pub secret_key: String,
    /// Mnemonic phrase the keys were derived from
    pub mnemonic: String,
}

/// Normalized outcome of one lookup against one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LookupResult {
    /// The source reported a nonzero amount
    Value { amount: String },
    /// Zero, unknown, or the lookup failed
    NoValue,
}

impl LookupResult {
    /// Normalize a displayed amount such as `"$1,234.56"`.
    ///
    /// Only an amount that parses to a strictly positive number counts as value.
    pub fn from_amount(raw: &str) -> Self {
        let amount = raw.trim();
        // First numeric token only, so a trailing "(@ $3,000/ETH)" does not leak in.
        let numeric: String = amount
            .split_whitespace()
            .find(|token| token.chars().any(|c| c.is_ascii_digit()))
            .unwrap_or("")
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();

        match numeric.parse::<f64>() {
            Ok(v) if v > 0.0 && v.is_finite() => LookupResult::Value {
                amount: amount.to_string(),
            },
            _ => LookupResult::NoValue,
        }
    }

    pub fn has_value(&self) -> bool {
        matches!(self, LookupResult::Value { .. })
    }
}

/// Result from a single named source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    pub result: LookupResult,
}

/// Persisted record of a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub address: String,
    pub mnemonic: String,
    /// Candidate entropy, hex encoded
    pub entropy: String,
    pub secret_key: String,
    pub reports: Vec<SourceReport>,
    pub timestamp: DateTime<Utc>,
}

impl Finding {
    pub fn new(identity: Identity, candidate: &Candidate, reports: Vec<SourceReport>) -> Self {
        Self {
            address: identity.address,
            mnemonic: identity.mnemonic,
            entropy: candidate.to_hex(),
            secret_key: identity.secret_key,
            reports,
            timestamp: Utc::now(),
        }
    }
}

/// Terminal state of one verification cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// At least one source reported value
    Match(Box<Finding>),
    /// Every source reported no value
    NoMatch,
    /// The cycle failed before a lookup result was available
    Error(String),
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Match(_))
    }
}

/// One outcome message from a worker unit to the aggregator.
#[derive(Debug, Clone)]
pub struct CycleEvent {
    /// Index of the unit that produced the outcome
    pub unit: usize,
    pub outcome: CycleOutcome,
}

/// Host metrics produced by a resource sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Receive rate in KB/s
    pub net_rx: f64,
    /// Transmit rate in KB/s
    pub net_tx: f64,
    /// CPU load in percent
    pub cpu: f64,
    /// RAM usage in percent
    pub ram: f64,
}

/// Aggregate counters owned by the aggregator.
///
/// Serialized with camelCase keys; unknown or missing keys fall back to zero so older
/// snapshots still load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Stats {
    /// Cycles that produced a match
    pub success: u64,
    /// Cycles that produced no match or an error
    pub fail: u64,
    /// Cycles observed since the counters were first created
    pub total_tries: u64,
    /// Cycles observed in the current throughput window
    pub tries: u64,
    /// Cycles observed in the last completed throughput window
    pub tries_per_min: u64,
    #[serde(deserialize_with = "lenient_f64")]
    pub net_rx: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub net_tx: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub cpu: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub ram: f64,
}

/// Resource figures may be stored as numbers or as fixed-point strings such as
/// `"1.25"`. Anything unreadable counts as zero; they are refreshed every sample.
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(parsed.filter(|v| v.is_finite()).unwrap_or(0.0))
}

impl Stats {
    /// Count one completed cycle.
    pub fn record(&mut self, outcome: &CycleOutcome) {
        if outcome.is_success() {
            self.success += 1;
        } else {
            self.fail += 1;
        }
        self.total_tries += 1;
        self.tries += 1;
    }

    /// Close the current throughput window and start a new one.
    pub fn roll_window(&mut self) -> u64 {
        self.tries_per_min = self.tries;
        self.tries = 0;
        self.tries_per_min
    }

    pub fn apply_sample(&mut self, sample: &ResourceSample) {
        self.net_rx = sample.net_rx;
        self.net_tx = sample.net_tx;
        self.cpu = sample.cpu;
        self.ram = sample.ram;
    }

    /// `success + fail == total_tries`
    pub fn is_consistent(&self) -> bool {
        self.success + self.fail == self.total_tries
    }

    /// Prepare a snapshot loaded from disk for a new run.
    ///
    /// Repairs snapshots that predate `totalTries` and drops the stored window count,
    /// since those cycles belong to the previous process.
    pub fn normalized(mut self) -> Self {
        if !self.is_consistent() {
            self.total_tries = self.success + self.fail;
        }
        self.tries = 0;
        self
    }
}
