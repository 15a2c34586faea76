//! Collector Facade
//!
//! The boundary the demo backends talk to: capture an incident, verify the
//! chain, and read-only projections of what was recorded.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use super::canonical::Canonicalizer;
use super::ledger::ChainLedger;
use super::store::{EvidenceStore, FsEvidenceStore};
use super::verifier::ChainVerifier;
use super::{
    CaptureReceipt, ChainEntry, ChainHead, ChainVerification, CustodyError, EvidenceBlob,
    Result, Severity,
};
use crate::config::CollectorConfig;

/// Listing filter for `list_incidents`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentQuery {
    pub min_severity: Option<Severity>,
    pub limit: Option<usize>,
}

/// A ledger entry together with its evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentDetail {
    pub chain_entry: ChainEntry,
    pub evidence_blob: EvidenceBlob,
    /// Every blob field agrees with the ledger row.
    pub evidence_consistent: bool,
    /// SHA-256 of the blob bytes as stored.
    pub evidence_digest: String,
}

pub struct Collector {
    config: CollectorConfig,
    ledger: Arc<ChainLedger>,
    verifier: ChainVerifier,
}

impl Collector {
    pub async fn open(config: CollectorConfig) -> Result<Self> {
        let store = Arc::new(FsEvidenceStore::open(&config.evidence_dir).await?);
        Self::with_store(config, store).await
    }

    pub async fn with_store(config: CollectorConfig, store: Arc<dyn EvidenceStore>) -> Result<Self> {
        let ledger = Arc::new(ChainLedger::open(&config.ledger_path, store, config.lock_timeout).await?);
        let verifier = ChainVerifier::new(ledger.clone());
        info!(
            "📒 Evidence collector ready (ledger: {}, evidence: {})",
            config.ledger_path.display(),
            config.evidence_dir.display()
        );
        Ok(Self { config, ledger, verifier })
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<ChainLedger> {
        &self.ledger
    }

    /// Either both the entry and its evidence are durable, or nothing is.
    pub async fn capture_incident(
        &self,
        incident_type: &str,
        application: &str,
        severity: Severity,
        metadata: Value,
    ) -> Result<CaptureReceipt> {
        match self.ledger.capture(incident_type, application, severity, &metadata).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                warn!("Capture of {} from {} rejected: {}", incident_type, application, e);
                Err(e)
            }
        }
    }

    pub async fn verify_chain(&self) -> Result<ChainVerification> {
        self.verifier.verify().await
    }

    /// Most recent first.
    pub async fn list_incidents(&self, query: &IncidentQuery) -> Result<Vec<ChainEntry>> {
        self.ledger.list(query.min_severity, query.limit).await
    }

    pub async fn get_incident(&self, incident_id: &str) -> Result<IncidentDetail> {
        let chain_entry = self
            .ledger
            .get(incident_id)
            .await?
            .ok_or_else(|| CustodyError::NotFound(incident_id.to_string()))?;

        let store = self.ledger.store();
        let (bytes, evidence_blob) = store.load_with_bytes(&chain_entry.evidence_path).await.map_err(|e| match e {
            // A committed entry always has evidence; its absence is a storage fault.
            CustodyError::NotFound(path) => {
                CustodyError::StorageUnavailable(format!("evidence '{}' missing for committed entry", path))
            }
            other => other,
        })?;

        let evidence_consistent = evidence_blob.matches(&chain_entry);
        if !evidence_consistent {
            warn!("Evidence for {} disagrees with its ledger row", incident_id);
        }

        Ok(IncidentDetail {
            evidence_digest: Canonicalizer::content_digest(&bytes),
            chain_entry,
            evidence_blob,
            evidence_consistent,
        })
    }

    pub async fn head(&self) -> Result<ChainHead> {
        self.ledger.head().await
    }

    /// Blobs no committed entry points at, left behind by failed appends.
    /// Reported only; they are never deleted here.
    pub async fn orphaned_evidence(&self) -> Result<Vec<String>> {
        let referenced = self.ledger.referenced_paths().await?;
        let orphans: Vec<String> = self
            .ledger
            .store()
            .locators()
            .await?
            .into_iter()
            .filter(|loc| !referenced.contains(loc))
            .collect();
        if !orphans.is_empty() {
            info!("Found {} orphaned evidence blob(s)", orphans.len());
        }
        Ok(orphans)
    }
}
