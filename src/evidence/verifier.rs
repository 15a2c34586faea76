//! Chain Verifier
//!
//! Replays a ledger snapshot from genesis. Each digest is recomputed from the
//! entry's stored fields and the *recomputed* predecessor digest, so a forger
//! who rewrites a hash and the next entry's `previous_hash` consistently is
//! still caught at the first altered entry.

use std::sync::Arc;
use tracing::{info, warn};

use super::canonical::{Canonicalizer, EntryFields, GENESIS_HASH};
use super::ledger::ChainLedger;
use super::{ChainEntry, ChainVerification, Result};

pub struct ChainVerifier {
    ledger: Arc<ChainLedger>,
}

impl ChainVerifier {
    pub fn new(ledger: Arc<ChainLedger>) -> Self {
        Self { ledger }
    }

    /// Verify everything committed at the moment of the call.
    ///
    /// Only an unreadable ledger is an error; a broken chain is reported in
    /// the returned value.
    pub async fn verify(&self) -> Result<ChainVerification> {
        let (len, entries) = self.ledger.snapshot().await?;
        let outcome = replay(len, &entries);

        match outcome.first_failure {
            None => info!("✅ Chain verified: {} entries intact", outcome.entries),
            Some(at) => warn!(
                "❌ Chain verification failed at #{} of {}: {}",
                at,
                outcome.entries,
                outcome.reason.as_deref().unwrap_or("unknown")
            ),
        }
        Ok(outcome)
    }
}

/// Check `entries`, expected to be sequence ids `1..=len` in order.
pub fn replay(len: u64, entries: &[ChainEntry]) -> ChainVerification {
    let mut previous_hash = GENESIS_HASH.to_string();
    let mut previous_id: Option<u64> = None;
    let mut expected: u64 = 1;

    for entry in entries.iter().take_while(|e| e.sequence_id <= len) {
        if entry.sequence_id != expected {
            return ChainVerification::failed(
                len,
                expected,
                format!("sequence gap: expected #{}, found #{}", expected, entry.sequence_id),
            );
        }
        if entry.previous_id != previous_id {
            return ChainVerification::failed(len, expected, "previous_id does not reference the predecessor");
        }
        if entry.previous_hash != previous_hash {
            return ChainVerification::failed(
                len,
                expected,
                "previous_hash does not match the recomputed predecessor digest",
            );
        }

        let recomputed = Canonicalizer::digest(&EntryFields::from(entry), &previous_hash);
        if recomputed != entry.evidence_hash {
            return ChainVerification::failed(len, expected, "evidence_hash does not match entry content");
        }

        previous_hash = recomputed;
        previous_id = Some(entry.sequence_id);
        expected += 1;
    }

    if expected <= len {
        return ChainVerification::failed(len, expected, format!("entry #{} is missing", expected));
    }
    ChainVerification::passed(len)
}
