//! Canonicalizer / Hasher
//!
//! Hash material for an entry is, byte for byte:
//!
//! ```text
//! [sequence_id,"incident_id","incident_type","application","severity","timestamp",previous_id,"evidence_path",metadata]
//! \n
//! previous_hash
//! ```
//!
//! Strings are JSON-escaped, `previous_id` is `null` for genesis, and
//! `metadata` is canonical JSON: object keys sorted by byte order, no
//! whitespace, numbers in `serde_json`'s shortest round-trip form. The
//! digest is lowercase hex SHA-256.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{ChainEntry, CustodyError, Result};

/// `previous_hash` of the first entry.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Nesting limit for metadata values.
const MAX_DEPTH: usize = 64;

/// The fields of an entry that go into its digest, in hashing order.
#[derive(Debug, Clone, Copy)]
pub struct EntryFields<'a> {
    pub sequence_id: u64,
    pub incident_id: &'a str,
    pub incident_type: &'a str,
    pub application: &'a str,
    pub severity: &'a str,
    pub timestamp: &'a str,
    pub previous_id: Option<u64>,
    pub evidence_path: &'a str,
    /// Already-canonical metadata JSON text.
    pub metadata: &'a str,
}

impl<'a> From<&'a ChainEntry> for EntryFields<'a> {
    fn from(entry: &'a ChainEntry) -> Self {
        Self {
            sequence_id: entry.sequence_id,
            incident_id: &entry.incident_id,
            incident_type: &entry.incident_type,
            application: &entry.application,
            severity: &entry.severity,
            timestamp: &entry.timestamp,
            previous_id: entry.previous_id,
            evidence_path: &entry.evidence_path,
            metadata: &entry.metadata,
        }
    }
}

pub struct Canonicalizer;

impl Canonicalizer {
    /// Canonical text for incident metadata. Only JSON objects are accepted.
    pub fn metadata(metadata: &Value) -> Result<String> {
        if !metadata.is_object() {
            return Err(CustodyError::Canonicalization(
                "metadata must be a JSON object".to_string(),
            ));
        }
        Self::canonical_json(metadata)
    }

    /// Deterministic JSON rendering of any value.
    pub fn canonical_json(value: &Value) -> Result<String> {
        let mut out = String::new();
        write_value(&mut out, value, 0)?;
        Ok(out)
    }

    /// RFC 3339, UTC, microsecond precision, `Z` suffix.
    pub fn timestamp(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Bytes fed to the hash function.
    pub fn material(fields: &EntryFields<'_>, previous_hash: &str) -> Vec<u8> {
        let previous_id = fields
            .previous_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "null".to_string());

        let mut out = String::with_capacity(256 + fields.metadata.len());
        out.push('[');
        out.push_str(&fields.sequence_id.to_string());
        for text in [
            fields.incident_id,
            fields.incident_type,
            fields.application,
            fields.severity,
            fields.timestamp,
        ] {
            out.push(',');
            push_string(&mut out, text);
        }
        out.push(',');
        out.push_str(&previous_id);
        out.push(',');
        push_string(&mut out, fields.evidence_path);
        out.push(',');
        out.push_str(fields.metadata);
        out.push(']');
        out.push('\n');
        out.push_str(previous_hash);
        out.into_bytes()
    }

    /// Digest of an entry chained onto `previous_hash`.
    pub fn digest(fields: &EntryFields<'_>, previous_hash: &str) -> String {
        hex::encode(Sha256::digest(Self::material(fields, previous_hash)))
    }

    /// Content digest of an arbitrary byte blob.
    pub fn content_digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }
}

fn push_string(out: &mut String, s: &str) {
    // Display on a JSON string value is infallible and yields escaped JSON.
    out.push_str(&Value::String(s.to_string()).to_string());
}

fn write_value(out: &mut String, value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(CustodyError::Canonicalization(format!(
            "metadata nested deeper than {} levels",
            MAX_DEPTH
        )));
    }

    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => push_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item, depth + 1)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_string(out, key);
                out.push(':');
                write_value(out, &map[key], depth + 1)?;
            }
            out.push('}');
        }
    }
    Ok(())
}
