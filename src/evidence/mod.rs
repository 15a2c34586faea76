//! Evidence Chain of Custody
//!
//! An append-only, hash-linked ledger of compliance incidents. Every entry
//! commits to its predecessor's digest, so inserting, reordering or editing
//! a recorded incident is detectable by replaying the chain from genesis.

pub mod canonical;
pub mod store;
pub mod ledger;
pub mod verifier;
pub mod collector;

pub use canonical::{Canonicalizer, GENESIS_HASH};
pub use collector::Collector;
pub use ledger::ChainLedger;
pub use store::{EvidenceStore, FsEvidenceStore};
pub use verifier::ChainVerifier;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Incident severity. The declaration order is the filtering order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = CustodyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INFO" => Ok(Severity::Info),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(CustodyError::Canonicalization(format!("unknown severity '{}'", other))),
        }
    }
}

// Same case-insensitive names as `FromStr`, wherever severity is decoded.
impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// A compliance event as handed to the collector. Immutable once captured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncidentRecord {
    pub incident_id: String,
    pub incident_type: String,
    pub application: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

/// One ledger row.
///
/// Severity, timestamp and metadata are kept in the exact textual form that
/// was hashed. The verifier hashes what is stored, so a value that no longer
/// parses (say, a severity rewritten to `"LOW"`) still shows up as a digest
/// mismatch rather than a decoding failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainEntry {
    pub sequence_id: u64,
    pub incident_id: String,
    pub incident_type: String,
    pub application: String,
    pub severity: String,
    pub timestamp: String,
    /// Canonical JSON text of the incident metadata.
    pub metadata: String,
    pub evidence_hash: String,
    pub previous_hash: String,
    pub previous_id: Option<u64>,
    pub evidence_path: String,
}

impl ChainEntry {
    /// Parsed severity, if the stored tag is still a known one.
    pub fn severity(&self) -> Option<Severity> {
        self.severity.parse().ok()
    }

    pub fn metadata_value(&self) -> Option<Value> {
        serde_json::from_str(&self.metadata).ok()
    }
}

/// Durable payload written to the evidence store before its ledger row.
///
/// Carries every chain entry field except the digest, which is computed
/// after the blob is safely on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceBlob {
    pub sequence_id: u64,
    pub incident_id: String,
    pub incident_type: String,
    pub application: String,
    pub severity: String,
    pub timestamp: String,
    pub metadata: Value,
    pub previous_hash: String,
    pub previous_id: Option<u64>,
    pub evidence_path: String,
}

impl EvidenceBlob {
    /// True when every field matches the ledger row it belongs to.
    pub fn matches(&self, entry: &ChainEntry) -> bool {
        let metadata_matches = Canonicalizer::canonical_json(&self.metadata)
            .map(|text| text == entry.metadata)
            .unwrap_or(false);

        self.sequence_id == entry.sequence_id
            && self.incident_id == entry.incident_id
            && self.incident_type == entry.incident_type
            && self.application == entry.application
            && self.severity == entry.severity
            && self.timestamp == entry.timestamp
            && self.previous_hash == entry.previous_hash
            && self.previous_id == entry.previous_id
            && self.evidence_path == entry.evidence_path
            && metadata_matches
    }
}

/// Outcome of replaying the chain. A failed verification is a result, not an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainVerification {
    pub verified: bool,
    /// Length of the ledger snapshot the replay ran against.
    pub entries: u64,
    pub first_failure: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ChainVerification {
    pub fn passed(entries: u64) -> Self {
        Self { verified: true, entries, first_failure: None, reason: None }
    }

    pub fn failed(entries: u64, at: u64, reason: impl Into<String>) -> Self {
        Self {
            verified: false,
            entries,
            first_failure: Some(at),
            reason: Some(reason.into()),
        }
    }
}

/// Current tip of the chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainHead {
    /// 0 when the ledger is empty.
    pub sequence_id: u64,
    pub evidence_hash: String,
}

impl ChainHead {
    pub fn genesis() -> Self {
        Self { sequence_id: 0, evidence_hash: GENESIS_HASH.to_string() }
    }

    pub fn is_genesis(&self) -> bool {
        self.sequence_id == 0
    }
}

/// What a successful capture hands back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureReceipt {
    pub incident_id: String,
    pub sequence_id: u64,
    pub evidence_hash: String,
}

/// Errors raised on the capture and lookup paths.
#[derive(Debug, thiserror::Error)]
pub enum CustodyError {
    #[error("metadata cannot be canonicalized: {0}")]
    Canonicalization(String),

    #[error("evidence already exists at '{0}'")]
    DuplicateEvidence(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("append lock not acquired within {0:?}")]
    LockContention(std::time::Duration),

    #[error("ledger head moved from #{expected} to #{found} before commit")]
    HeadMoved { expected: u64, found: u64 },

    #[error("incident '{0}' not found")]
    NotFound(String),
}

impl CustodyError {
    /// Transient conditions the caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CustodyError::LockContention(_) | CustodyError::HeadMoved { .. })
    }

    /// The request itself was bad; nothing was written.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, CustodyError::Canonicalization(_) | CustodyError::NotFound(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CustodyError::Canonicalization(_) => "canonicalization_error",
            CustodyError::DuplicateEvidence(_) => "duplicate_evidence",
            CustodyError::StorageUnavailable(_) => "storage_unavailable",
            CustodyError::LockContention(_) => "lock_contention",
            CustodyError::HeadMoved { .. } => "head_moved",
            CustodyError::NotFound(_) => "not_found",
        }
    }
}

impl From<std::io::Error> for CustodyError {
    fn from(err: std::io::Error) -> Self {
        CustodyError::StorageUnavailable(err.to_string())
    }
}

impl From<rusqlite::Error> for CustodyError {
    fn from(err: rusqlite::Error) -> Self {
        CustodyError::StorageUnavailable(format!("ledger: {}", err))
    }
}

impl From<tokio::task::JoinError> for CustodyError {
    fn from(err: tokio::task::JoinError) -> Self {
        CustodyError::StorageUnavailable(format!("storage task aborted: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, CustodyError>;
