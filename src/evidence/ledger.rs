//! Chain Ledger
//!
//! Append-only SQLite table of chain entries. Writers are serialized through
//! a single in-process append lock, and each commit re-checks the head
//! inside an immediate transaction so that a second process sharing the file
//! cannot fork the chain either. Readers open their own connections and,
//! with WAL journaling, never wait on the writer.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::canonical::{Canonicalizer, EntryFields};
use super::store::EvidenceStore;
use super::{
    CaptureReceipt, ChainEntry, ChainHead, CustodyError, EvidenceBlob, IncidentRecord, Result,
    Severity,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ENTRY_COLUMNS: &str = "sequence_id, incident_id, incident_type, application, severity, \
     timestamp, metadata, evidence_hash, previous_hash, previous_id, evidence_path";

pub struct ChainLedger {
    db_path: PathBuf,
    store: Arc<dyn EvidenceStore>,
    append_lock: Mutex<()>,
    lock_timeout: Duration,
}

fn connect(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<ChainEntry> {
    let sequence_id: i64 = row.get(0)?;
    let previous_id: Option<i64> = row.get(9)?;
    Ok(ChainEntry {
        sequence_id: sequence_id as u64,
        incident_id: row.get(1)?,
        incident_type: row.get(2)?,
        application: row.get(3)?,
        severity: row.get(4)?,
        timestamp: row.get(5)?,
        metadata: row.get(6)?,
        evidence_hash: row.get(7)?,
        previous_hash: row.get(8)?,
        previous_id: previous_id.map(|id| id as u64),
        evidence_path: row.get(10)?,
    })
}

fn read_head(conn: &Connection) -> rusqlite::Result<ChainHead> {
    let head = conn
        .query_row(
            "SELECT sequence_id, evidence_hash FROM chain_entries ORDER BY sequence_id DESC LIMIT 1",
            [],
            |row| {
                let seq: i64 = row.get(0)?;
                Ok(ChainHead { sequence_id: seq as u64, evidence_hash: row.get(1)? })
            },
        )
        .optional()?;
    Ok(head.unwrap_or_else(ChainHead::genesis))
}

impl ChainLedger {
    pub async fn open(
        db_path: impl AsRef<Path>,
        store: Arc<dyn EvidenceStore>,
        lock_timeout: Duration,
    ) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            if let Some(parent) = path_clone.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let conn = connect(&path_clone)?;
            let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS chain_entries (
                    sequence_id INTEGER PRIMARY KEY,
                    incident_id TEXT NOT NULL UNIQUE,
                    incident_type TEXT NOT NULL,
                    application TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    evidence_hash TEXT NOT NULL,
                    previous_hash TEXT NOT NULL,
                    previous_id INTEGER,
                    evidence_path TEXT NOT NULL
                );

                CREATE TRIGGER IF NOT EXISTS chain_entries_no_update
                BEFORE UPDATE ON chain_entries
                BEGIN
                    SELECT RAISE(ABORT, 'chain_entries is append-only');
                END;

                CREATE TRIGGER IF NOT EXISTS chain_entries_no_delete
                BEFORE DELETE ON chain_entries
                BEGIN
                    SELECT RAISE(ABORT, 'chain_entries is append-only');
                END;
                "#,
            )?;

            Ok::<_, CustodyError>(())
        })
        .await??;

        Ok(Self {
            db_path: path,
            store,
            append_lock: Mutex::new(()),
            lock_timeout,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn store(&self) -> &Arc<dyn EvidenceStore> {
        &self.store
    }

    /// Record one incident and link it onto the current head.
    ///
    /// Evidence is on disk before the ledger row commits. If the commit
    /// fails the blob stays behind unreferenced and no sequence id is issued.
    pub async fn capture(
        &self,
        incident_type: &str,
        application: &str,
        severity: Severity,
        metadata: &Value,
    ) -> Result<CaptureReceipt> {
        if incident_type.trim().is_empty() || application.trim().is_empty() {
            return Err(CustodyError::Canonicalization(
                "incident_type and application must not be empty".to_string(),
            ));
        }
        let metadata_text = Canonicalizer::metadata(metadata)?;
        let incident_id = Uuid::new_v4().to_string();
        let evidence_path = self.store.locator(&incident_id)?;

        let _guard = tokio::time::timeout(self.lock_timeout, self.append_lock.lock())
            .await
            .map_err(|_| CustodyError::LockContention(self.lock_timeout))?;

        let head = self.head().await?;
        let sequence_id = head.sequence_id + 1;
        let previous_id = (!head.is_genesis()).then_some(head.sequence_id);
        let record = IncidentRecord {
            incident_id,
            incident_type: incident_type.to_string(),
            application: application.to_string(),
            severity,
            timestamp: Utc::now(),
            metadata: metadata.clone(),
        };
        let timestamp = Canonicalizer::timestamp(&record.timestamp);

        let blob = EvidenceBlob {
            sequence_id,
            incident_id: record.incident_id.clone(),
            incident_type: record.incident_type.clone(),
            application: record.application.clone(),
            severity: record.severity.as_str().to_string(),
            timestamp: timestamp.clone(),
            metadata: record.metadata,
            previous_hash: head.evidence_hash.clone(),
            previous_id,
            evidence_path: evidence_path.clone(),
        };
        self.store.persist(&blob).await?;

        let mut entry = ChainEntry {
            sequence_id,
            incident_id: blob.incident_id,
            incident_type: blob.incident_type,
            application: blob.application,
            severity: blob.severity,
            timestamp,
            metadata: metadata_text,
            evidence_hash: String::new(),
            previous_hash: head.evidence_hash,
            previous_id,
            evidence_path,
        };
        entry.evidence_hash = Canonicalizer::digest(&EntryFields::from(&entry), &entry.previous_hash);

        if let Err(e) = self.append(&entry, head.sequence_id).await {
            warn!(
                "Ledger append for #{} failed, evidence '{}' left unreferenced: {}",
                sequence_id, entry.evidence_path, e
            );
            return Err(e);
        }

        info!(
            "⛓️  Captured incident {} as #{} ({} / {} / {}) hash={}",
            entry.incident_id,
            sequence_id,
            entry.incident_type,
            entry.application,
            entry.severity,
            &entry.evidence_hash[..12]
        );

        Ok(CaptureReceipt {
            incident_id: entry.incident_id,
            sequence_id,
            evidence_hash: entry.evidence_hash,
        })
    }

    async fn append(&self, entry: &ChainEntry, expected_head: u64) -> Result<()> {
        let path = self.db_path.clone();
        let entry = entry.clone();

        task::spawn_blocking(move || {
            let mut conn = connect(&path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let found: Option<i64> =
                tx.query_row("SELECT MAX(sequence_id) FROM chain_entries", [], |row| row.get(0))?;
            let found = found.unwrap_or(0) as u64;
            if found != expected_head {
                return Err(CustodyError::HeadMoved { expected: expected_head, found });
            }

            tx.execute(
                &format!(
                    "INSERT INTO chain_entries ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    ENTRY_COLUMNS
                ),
                params![
                    entry.sequence_id as i64,
                    &entry.incident_id,
                    &entry.incident_type,
                    &entry.application,
                    &entry.severity,
                    &entry.timestamp,
                    &entry.metadata,
                    &entry.evidence_hash,
                    &entry.previous_hash,
                    entry.previous_id.map(|id| id as i64),
                    &entry.evidence_path,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    /// Current tip, or the genesis head when the ledger is empty.
    pub async fn head(&self) -> Result<ChainHead> {
        let path = self.db_path.clone();
        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            Ok::<_, CustodyError>(read_head(&conn)?)
        })
        .await?
    }

    /// Entries `1..=N` where `N` is the highest sequence id at call time,
    /// read inside one transaction so concurrent appends are not observed.
    pub async fn snapshot(&self) -> Result<(u64, Vec<ChainEntry>)> {
        let path = self.db_path.clone();
        task::spawn_blocking(move || {
            let mut conn = connect(&path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;

            let len: Option<i64> =
                tx.query_row("SELECT MAX(sequence_id) FROM chain_entries", [], |row| row.get(0))?;
            let len = len.unwrap_or(0);

            let entries = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM chain_entries WHERE sequence_id <= ?1 ORDER BY sequence_id ASC",
                    ENTRY_COLUMNS
                ))?;
                let rows = stmt.query_map(params![len], row_to_entry)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            tx.commit()?;

            debug!("Ledger snapshot taken at length {}", len);
            Ok::<_, CustodyError>((len as u64, entries))
        })
        .await?
    }

    /// Most-recent-first listing, optionally floored at a severity.
    pub async fn list(&self, min_severity: Option<Severity>, limit: Option<usize>) -> Result<Vec<ChainEntry>> {
        let path = self.db_path.clone();
        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM chain_entries ORDER BY sequence_id DESC",
                ENTRY_COLUMNS
            ))?;
            let rows = stmt.query_map([], row_to_entry)?;

            let mut out = Vec::new();
            for row in rows {
                if limit.map(|l| out.len() >= l).unwrap_or(false) {
                    break;
                }
                let entry = row?;
                if let Some(floor) = min_severity {
                    if !entry.severity().map(|s| s >= floor).unwrap_or(false) {
                        continue;
                    }
                }
                out.push(entry);
            }
            Ok::<_, CustodyError>(out)
        })
        .await?
    }

    pub async fn get(&self, incident_id: &str) -> Result<Option<ChainEntry>> {
        let path = self.db_path.clone();
        let id = incident_id.to_string();
        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            let entry = conn
                .query_row(
                    &format!("SELECT {} FROM chain_entries WHERE incident_id = ?1", ENTRY_COLUMNS),
                    params![&id],
                    row_to_entry,
                )
                .optional()?;
            Ok::<_, CustodyError>(entry)
        })
        .await?
    }

    /// Evidence locators referenced by any committed entry.
    pub async fn referenced_paths(&self) -> Result<HashSet<String>> {
        let path = self.db_path.clone();
        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            let mut stmt = conn.prepare("SELECT evidence_path FROM chain_entries")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let paths = rows.collect::<rusqlite::Result<HashSet<_>>>()?;
            Ok::<_, CustodyError>(paths)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::store::FsEvidenceStore;
    use crate::evidence::{ChainVerification, GENESIS_HASH};
    use async_trait::async_trait;
    use serde_json::json;

    async fn ledger_in(dir: &Path) -> Result<ChainLedger> {
        let store = Arc::new(FsEvidenceStore::open(dir.join("evidence")).await?);
        ChainLedger::open(dir.join("ledger.db"), store, Duration::from_secs(2)).await
    }

    /// Store whose writes always fail, as if the disk were gone.
    struct UnavailableStore;

    #[async_trait]
    impl EvidenceStore for UnavailableStore {
        fn locator(&self, incident_id: &str) -> Result<String> {
            Ok(format!("{}.json", incident_id))
        }
        async fn persist(&self, _blob: &EvidenceBlob) -> Result<String> {
            Err(CustodyError::StorageUnavailable("disk detached".to_string()))
        }
        async fn load_bytes(&self, evidence_path: &str) -> Result<Vec<u8>> {
            Err(CustodyError::NotFound(evidence_path.to_string()))
        }
        async fn locators(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_genesis_and_linkage() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = ledger_in(dir.path()).await?;
        assert_eq!(ledger.head().await?, ChainHead::genesis());

        let first = ledger.capture("FDA_VALIDATION_FAILURE", "lims-backend", Severity::Critical, &json!({})).await?;
        let second = ledger.capture("SOX_COMPLIANCE_ALERT", "finance-trading", Severity::High, &json!({"amount": "$1"})).await?;
        assert_eq!((first.sequence_id, second.sequence_id), (1, 2));

        let (len, entries) = ledger.snapshot().await?;
        assert_eq!(len, 2);
        assert_eq!(entries[0].previous_hash, GENESIS_HASH);
        assert_eq!(entries[0].previous_id, None);
        assert_eq!(entries[1].previous_hash, entries[0].evidence_hash);
        assert_eq!(entries[1].previous_id, Some(1));
        assert_eq!(ledger.head().await?.evidence_hash, second.evidence_hash);
        Ok(())
    }

    #[tokio::test]
    async fn test_evidence_written_before_row() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = ledger_in(dir.path()).await?;
        let receipt = ledger.capture("GMP_DEVIATION", "pharma-manufacturing", Severity::High, &json!({"duration": "47 minutes"})).await?;

        let entry = ledger.get(&receipt.incident_id).await?.expect("entry committed");
        let blob = ledger.store().load(&entry.evidence_path).await?;
        assert!(blob.matches(&entry));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_bad_input_without_side_effects() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = ledger_in(dir.path()).await?;

        let err = ledger.capture("X", "app", Severity::Info, &json!("not an object")).await.unwrap_err();
        assert!(matches!(err, CustodyError::Canonicalization(_)));
        let err = ledger.capture(" ", "app", Severity::Info, &json!({})).await.unwrap_err();
        assert!(matches!(err, CustodyError::Canonicalization(_)));

        assert!(ledger.head().await?.is_genesis());
        assert!(ledger.store().locators().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_storage_failure_appends_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = ChainLedger::open(dir.path().join("ledger.db"), Arc::new(UnavailableStore), Duration::from_secs(1)).await?;

        let err = ledger.capture("X", "app", Severity::Info, &json!({})).await.unwrap_err();
        assert!(matches!(err, CustodyError::StorageUnavailable(_)));
        assert_eq!(ledger.snapshot().await?.0, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_append_leaves_orphan_and_issues_no_id() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = ledger_in(dir.path()).await?;

        let conn = Connection::open(ledger.db_path())?;
        conn.execute_batch(
            "CREATE TRIGGER refuse_insert BEFORE INSERT ON chain_entries \
             BEGIN SELECT RAISE(ABORT, 'simulated failure'); END;",
        )?;

        let err = ledger.capture("X", "app", Severity::Info, &json!({})).await.unwrap_err();
        assert!(matches!(err, CustodyError::StorageUnavailable(_)));
        assert_eq!(ledger.store().locators().await?.len(), 1);
        assert!(ledger.referenced_paths().await?.is_empty());

        conn.execute_batch("DROP TRIGGER refuse_insert;")?;
        let receipt = ledger.capture("X", "app", Severity::Info, &json!({})).await?;
        assert_eq!(receipt.sequence_id, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_rows_are_append_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = ledger_in(dir.path()).await?;
        ledger.capture("X", "app", Severity::Info, &json!({})).await?;

        let conn = Connection::open(ledger.db_path())?;
        assert!(conn.execute("UPDATE chain_entries SET severity = 'CRITICAL'", []).is_err());
        assert!(conn.execute("DELETE FROM chain_entries", []).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_contention_times_out() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(FsEvidenceStore::open(dir.path().join("evidence")).await?);
        let ledger = ChainLedger::open(dir.path().join("ledger.db"), store, Duration::from_millis(50)).await?;

        let _held = ledger.append_lock.lock().await;
        let err = ledger.capture("X", "app", Severity::Info, &json!({})).await.unwrap_err();
        assert!(matches!(err, CustodyError::LockContention(_)));
        assert!(err.is_retryable());
        Ok(())
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = ledger_in(dir.path()).await?;
        ledger.capture("A", "app", Severity::Info, &json!({})).await?;
        ledger.capture("B", "app", Severity::Critical, &json!({})).await?;
        ledger.capture("C", "app", Severity::High, &json!({})).await?;

        let all = ledger.list(None, None).await?;
        let ids: Vec<u64> = all.iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        let serious = ledger.list(Some(Severity::High), None).await?;
        let types: Vec<&str> = serious.iter().map(|e| e.incident_type.as_str()).collect();
        assert_eq!(types, vec!["C", "B"]);

        assert_eq!(ledger.list(None, Some(1)).await?.len(), 1);
        assert!(ledger.list(None, Some(0)).await?.is_empty());
        assert!(ledger.list(Some(Severity::High), Some(0)).await?.is_empty());
        Ok(())
    }

    /// Wraps a real store and parks `persist` until released, so a second
    /// writer can commit between this writer's head read and its append.
    struct GatedStore {
        inner: FsEvidenceStore,
        entered: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl EvidenceStore for GatedStore {
        fn locator(&self, incident_id: &str) -> Result<String> {
            self.inner.locator(incident_id)
        }
        async fn persist(&self, blob: &EvidenceBlob) -> Result<String> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.persist(blob).await
        }
        async fn load_bytes(&self, evidence_path: &str) -> Result<Vec<u8>> {
            self.inner.load_bytes(evidence_path).await
        }
        async fn locators(&self) -> Result<Vec<String>> {
            self.inner.locators().await
        }
    }

    #[tokio::test]
    async fn test_commit_refused_when_another_writer_moved_head() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = dir.path().join("ledger.db");
        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());

        let gated = GatedStore {
            inner: FsEvidenceStore::open(dir.path().join("evidence")).await?,
            entered: entered.clone(),
            release: release.clone(),
        };
        let slow = Arc::new(ChainLedger::open(&db, Arc::new(gated), Duration::from_secs(2)).await?);
        let fast = ledger_in(dir.path()).await?;

        let pending = {
            let slow = slow.clone();
            tokio::spawn(async move { slow.capture("A", "app", Severity::Info, &json!({})).await })
        };
        entered.notified().await;

        let committed = fast.capture("B", "app", Severity::High, &json!({})).await?;
        assert_eq!(committed.sequence_id, 1);
        release.notify_one();

        let err = pending.await?.unwrap_err();
        assert!(matches!(err, CustodyError::HeadMoved { expected: 0, found: 1 }));
        assert!(err.is_retryable());

        let (len, entries) = fast.snapshot().await?;
        assert_eq!(crate::evidence::verifier::replay(len, &entries), ChainVerification::passed(1));

        // The refused writer retries cleanly on top of the new head.
        release.notify_one();
        let retried = slow.capture("A", "app", Severity::Info, &json!({})).await?;
        assert_eq!(retried.sequence_id, 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_writers_on_one_file_never_fork() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let first = Arc::new(ledger_in(dir.path()).await?);
        let second = Arc::new(ledger_in(dir.path()).await?);

        let mut handles = Vec::new();
        for i in 0..40u32 {
            let ledger = if i % 2 == 0 { first.clone() } else { second.clone() };
            handles.push(tokio::spawn(async move {
                ledger.capture("AUDIT_EVENT", "app", Severity::Info, &json!({"i": i})).await
            }));
        }

        let mut committed = 0u64;
        for handle in handles {
            match handle.await? {
                Ok(_) => committed += 1,
                Err(CustodyError::HeadMoved { .. }) => {}
                Err(other) => panic!("unexpected capture failure: {}", other),
            }
        }

        let (len, entries) = first.snapshot().await?;
        assert_eq!(len, committed);
        assert_eq!(crate::evidence::verifier::replay(len, &entries), ChainVerification::passed(committed));
        Ok(())
    }
}
