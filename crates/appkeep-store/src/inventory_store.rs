use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use appkeep_core::InventoryEntry;
use async_trait::async_trait;

use crate::StoreError;

/// Persisted per-identity list of installed applications.
///
/// Implementations do not serialize read-modify-write cycles themselves;
/// callers hold a per-identity lock around `get_entries` + `replace_entries`.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn get_entries(&self, identity: &str) -> Result<Vec<InventoryEntry>, StoreError>;
    async fn replace_entries(
        &self,
        identity: &str,
        entries: Vec<InventoryEntry>,
    ) -> Result<(), StoreError>;
}

pub fn validate_identity(identity: &str) -> Result<(), StoreError> {
    let valid = !identity.is_empty()
        && identity.len() <= 128
        && !identity.starts_with('.')
        && identity
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '@' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentity(identity.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct FileInventoryStore {
    root: PathBuf,
}

impl FileInventoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, identity: &str) -> PathBuf {
        self.root.join(format!("{identity}.json"))
    }
}

#[async_trait]
impl InventoryStore for FileInventoryStore {
    async fn get_entries(&self, identity: &str) -> Result<Vec<InventoryEntry>, StoreError> {
        validate_identity(identity)?;
        let path = self.record_path(identity);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io("failed to read inventory record", path, err)),
        };
        serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
            identity: identity.to_string(),
            source,
        })
    }

    async fn replace_entries(
        &self,
        identity: &str,
        entries: Vec<InventoryEntry>,
    ) -> Result<(), StoreError> {
        validate_identity(identity)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| StoreError::io("failed to create inventory dir", &self.root, err))?;

        let path = self.record_path(identity);
        let payload = serde_json::to_vec_pretty(&entries).map_err(|source| {
            StoreError::Corrupt {
                identity: identity.to_string(),
                source,
            }
        })?;
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || write_record(&root, &path, &payload))
            .await
            .map_err(|err| {
                StoreError::io("inventory write task failed", &self.root, io::Error::other(err))
            })??;
        tracing::debug!(identity, entries = entries.len(), "inventory record replaced");
        Ok(())
    }
}

/// Writes `payload` to a uniquely named temp file in `root` and renames it
/// over `path`, so concurrent writers never share a temp file.
fn write_record(root: &Path, path: &Path, payload: &[u8]) -> Result<(), StoreError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".inventory-")
        .suffix(".json.tmp")
        .tempfile_in(root)
        .map_err(|err| StoreError::io("failed to create inventory temp file", root, err))?;
    tmp.write_all(payload)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| StoreError::io("failed to write inventory record", tmp.path(), err))?;
    tmp.persist(path)
        .map_err(|err| StoreError::io("failed to replace inventory record", path, err.error))?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryInventoryStore {
    records: Mutex<HashMap<String, Vec<InventoryEntry>>>,
}

impl MemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InventoryStore for MemoryInventoryStore {
    async fn get_entries(&self, identity: &str) -> Result<Vec<InventoryEntry>, StoreError> {
        validate_identity(identity)?;
        let records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(records.get(identity).cloned().unwrap_or_default())
    }

    async fn replace_entries(
        &self,
        identity: &str,
        entries: Vec<InventoryEntry>,
    ) -> Result<(), StoreError> {
        validate_identity(identity)?;
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.insert(identity.to_string(), entries);
        Ok(())
    }
}
