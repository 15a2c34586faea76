//! Collector configuration
//!
//! Defaults, overlaid by `CUSTODY_*` environment variables (a `.env` file is
//! honoured when present).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectorConfig {
    /// SQLite file holding the chain entries
    pub ledger_path: PathBuf,
    /// Directory of write-once evidence blobs
    pub evidence_dir: PathBuf,
    /// How long a capture waits for the append lock
    #[serde(with = "millis")]
    pub lock_timeout: Duration,
    pub bind_addr: String,
    /// Rolling log files are written here when set
    pub log_dir: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from("custody_ledger.db"),
            evidence_dir: PathBuf::from("evidence"),
            lock_timeout: Duration::from_secs(5),
            bind_addr: "0.0.0.0:8090".to_string(),
            log_dir: None,
        }
    }
}

impl CollectorConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("CUSTODY_LEDGER_PATH") {
            config.ledger_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("CUSTODY_EVIDENCE_DIR") {
            config.evidence_dir = PathBuf::from(dir);
        }
        if let Some(ms) = lookup("CUSTODY_LOCK_TIMEOUT_MS") {
            let ms: u64 = ms
                .trim()
                .parse()
                .with_context(|| format!("CUSTODY_LOCK_TIMEOUT_MS must be milliseconds, got '{}'", ms))?;
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(addr) = lookup("CUSTODY_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(dir) = lookup("CUSTODY_LOG_DIR").filter(|d| !d.trim().is_empty()) {
            config.log_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    /// Ledger and evidence both rooted under `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            ledger_path: dir.join("custody_ledger.db"),
            evidence_dir: dir.join("evidence"),
            ..Self::default()
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
