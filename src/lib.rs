//! Evidence Chain of Custody
//! 
//! Tamper-evident recording of compliance incidents raised by the demo
//! line-of-business backends:
//! - Canonical, deterministic hashing of incident fields
//! - Write-once evidence blobs on disk
//! - Append-only, hash-linked SQLite ledger
//! - Independent replay verification from genesis
//! - HTTP boundary for capture, lookup and verification

pub mod config;
pub mod evidence;
pub mod server;
pub mod utils;

// Re-exports for convenience
pub use config::CollectorConfig;
pub use evidence::{ChainEntry, ChainVerification, Collector, CustodyError, Severity};
