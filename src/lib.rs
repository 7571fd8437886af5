//! seedprobe - concurrent generate and verify engine
//!
//! Generates random BIP-39 candidates, derives their addresses, checks them against
//! block explorer balance pages and keeps consistent running statistics with durable
//! snapshots and an append-only findings log.

pub mod types;
pub mod identity;
pub mod oracle;
pub mod engine;

// Re-export main types for convenience
pub use types::{Candidate, CycleOutcome, Finding, Identity, LookupResult, Stats};
