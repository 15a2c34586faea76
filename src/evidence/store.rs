//! Evidence Store
//!
//! Write-once blobs, one per incident, addressed by incident id. Blobs are
//! written in canonical JSON so that reading one back yields exactly the
//! bytes that were persisted.

use async_trait::async_trait;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::task;
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use super::canonical::Canonicalizer;
use super::{CustodyError, EvidenceBlob, Result};

const BLOB_EXTENSION: &str = "json";

/// Storage interface for evidence blobs.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Locator a blob for `incident_id` will be stored under.
    fn locator(&self, incident_id: &str) -> Result<String>;

    /// Write the blob at `locator(blob.incident_id)`. Never overwrites.
    async fn persist(&self, blob: &EvidenceBlob) -> Result<String>;

    /// Raw persisted bytes.
    async fn load_bytes(&self, evidence_path: &str) -> Result<Vec<u8>>;

    /// Every locator currently present in the store.
    async fn locators(&self) -> Result<Vec<String>>;

    async fn load(&self, evidence_path: &str) -> Result<EvidenceBlob> {
        Ok(self.load_with_bytes(evidence_path).await?.1)
    }

    /// Persisted bytes together with the blob decoded from them.
    async fn load_with_bytes(&self, evidence_path: &str) -> Result<(Vec<u8>, EvidenceBlob)> {
        let bytes = self.load_bytes(evidence_path).await?;
        let blob = serde_json::from_slice(&bytes).map_err(|e| {
            CustodyError::StorageUnavailable(format!("corrupt evidence '{}': {}", evidence_path, e))
        })?;
        Ok((bytes, blob))
    }
}

/// Filesystem-backed store: `<root>/<incident_id>.json`, read-only once written.
#[derive(Debug, Clone)]
pub struct FsEvidenceStore {
    root: PathBuf,
}

impl FsEvidenceStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, evidence_path: &str) -> Option<PathBuf> {
        let stem = evidence_path.strip_suffix(&format!(".{}", BLOB_EXTENSION))?;
        is_safe_id(stem).then(|| self.root.join(evidence_path))
    }
}

/// Incident ids become file names, so only a conservative alphabet is allowed.
fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn write_once(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path)?;
    let written = file.write_all(bytes).and_then(|_| file.sync_all());
    if let Err(e) = written {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(e);
    }

    let mut perms = file.metadata()?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[async_trait]
impl EvidenceStore for FsEvidenceStore {
    fn locator(&self, incident_id: &str) -> Result<String> {
        if !is_safe_id(incident_id) {
            return Err(CustodyError::Canonicalization(format!(
                "incident id '{}' is not a valid evidence locator",
                incident_id
            )));
        }
        Ok(format!("{}.{}", incident_id, BLOB_EXTENSION))
    }

    async fn persist(&self, blob: &EvidenceBlob) -> Result<String> {
        let locator = self.locator(&blob.incident_id)?;
        let value = serde_json::to_value(blob)
            .map_err(|e| CustodyError::Canonicalization(e.to_string()))?;
        let bytes = Canonicalizer::canonical_json(&value)?.into_bytes();
        let path = self.root.join(&locator);
        let loc = locator.clone();

        task::spawn_blocking(move || match write_once(&path, &bytes) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(CustodyError::DuplicateEvidence(loc)),
            Err(e) => {
                warn!("Evidence write failed for {}: {}", path.display(), e);
                Err(CustodyError::StorageUnavailable(format!("evidence '{}': {}", loc, e)))
            }
        })
        .await??;

        debug!("Evidence persisted at {}", locator);
        Ok(locator)
    }

    async fn load_bytes(&self, evidence_path: &str) -> Result<Vec<u8>> {
        let path = self
            .resolve(evidence_path)
            .ok_or_else(|| CustodyError::NotFound(evidence_path.to_string()))?;

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(CustodyError::NotFound(evidence_path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn locators(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        task::spawn_blocking(move || {
            let mut found = Vec::new();
            for dirent in fs::read_dir(&root)? {
                let dirent = dirent?;
                if !dirent.file_type()?.is_file() {
                    continue;
                }
                if let Some(name) = dirent.file_name().to_str() {
                    let is_blob = name
                        .strip_suffix(&format!(".{}", BLOB_EXTENSION))
                        .map(is_safe_id)
                        .unwrap_or(false);
                    if is_blob {
                        found.push(name.to_string());
                    }
                }
            }
            found.sort();
            Ok::<_, CustodyError>(found)
        })
        .await?
    }
}
