//! Oracle module - external balance lookups.
//!
//! This module contains the source abstraction, the explorer scraper implementation
//! and the client that masks transient source failures.

pub mod types;
pub mod data_sources;
pub mod client;

// Re-export main types
pub use types::{ExtractionRule, LookupError, OracleConfig, SourceConfig};

// Re-export key components
pub use client::BalanceOracle;
pub use data_sources::{extract_value, BalanceSource, ExplorerSource};
