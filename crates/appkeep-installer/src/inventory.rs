use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use appkeep_core::{normalize_name, InventoryEntry};
use appkeep_store::{InventoryStore, StoreError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Serializes read-modify-write cycles on each identity's inventory record.
pub struct InventoryReconciler {
    store: Arc<dyn InventoryStore>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl InventoryReconciler {
    pub fn new(store: Arc<dyn InventoryStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, identity: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(identity.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    pub async fn entries(&self, identity: &str) -> Result<Vec<InventoryEntry>, StoreError> {
        self.store.get_entries(identity).await
    }

    /// Records a completed install. Any prior entry with the same name key or
    /// the same path is replaced, so repeating an install never duplicates.
    pub async fn record_install(
        &self,
        identity: &str,
        entry: InventoryEntry,
    ) -> Result<(), StoreError> {
        let _guard = self.lock(identity).await;
        let key = entry.key();
        let mut entries = self.store.get_entries(identity).await?;
        let before = entries.len();
        entries.retain(|existing| existing.key() != key && existing.path != entry.path);
        tracing::debug!(
            identity,
            name = %entry.name,
            replaced = before - entries.len(),
            "recording install"
        );
        entries.push(entry);
        self.store.replace_entries(identity, entries).await
    }

    /// Removes every entry whose name contains `resolved_name`
    /// (case-insensitive, whitespace-normalized) or whose path is
    /// `resolved_path`. Returns how many entries were removed; the record is
    /// left untouched when nothing matches.
    pub async fn record_uninstall(
        &self,
        identity: &str,
        resolved_name: &str,
        resolved_path: &Path,
    ) -> Result<usize, StoreError> {
        let _guard = self.lock(identity).await;
        let wanted = normalize_name(resolved_name);
        let wanted_path = resolved_path.to_string_lossy();
        let mut entries = self.store.get_entries(identity).await?;
        let before = entries.len();
        entries.retain(|entry| {
            let name = normalize_name(&entry.name);
            let name_matches = !wanted.is_empty() && name.contains(&wanted);
            !(name_matches || entry.path == wanted_path)
        });
        let removed = before - entries.len();
        if removed > 0 {
            self.store.replace_entries(identity, entries).await?;
        }
        tracing::debug!(identity, name = resolved_name, removed, "recording uninstall");
        Ok(removed)
    }

    /// Removes the entries recorded at exactly `path`. Returns how many were
    /// removed.
    pub async fn forget_path(&self, identity: &str, path: &Path) -> Result<usize, StoreError> {
        let _guard = self.lock(identity).await;
        let path = path.to_string_lossy();
        let mut entries = self.store.get_entries(identity).await?;
        let before = entries.len();
        entries.retain(|entry| entry.path != path);
        let removed = before - entries.len();
        if removed > 0 {
            self.store.replace_entries(identity, entries).await?;
        }
        Ok(removed)
    }

    /// Replaces the record with a fresh scan, keeping the original
    /// `installed_at` of applications that were already known.
    pub async fn replace_from_scan(
        &self,
        identity: &str,
        mut scanned: Vec<InventoryEntry>,
    ) -> Result<Vec<InventoryEntry>, StoreError> {
        let _guard = self.lock(identity).await;
        let existing = self.store.get_entries(identity).await?;
        let installed_at: HashMap<String, u64> = existing
            .iter()
            .map(|entry| (entry.key(), entry.installed_at_unix))
            .collect();
        for entry in &mut scanned {
            if let Some(first_seen) = installed_at.get(&entry.key()) {
                entry.installed_at_unix = *first_seen;
            }
        }
        self.store
            .replace_entries(identity, scanned.clone())
            .await?;
        Ok(scanned)
    }
}
