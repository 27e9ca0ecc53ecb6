use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use appkeep_core::ArchiveKind;
use sha2::{Digest, Sha256};

use crate::fs_utils::current_unix_timestamp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    prefix: PathBuf,
}

impl StateLayout {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn config_path(&self) -> PathBuf {
        self.prefix.join("config.toml")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.prefix.join("state")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.prefix.join("cache")
    }

    pub fn inventory_dir(&self) -> PathBuf {
        self.state_dir().join("inventory")
    }

    pub fn tmp_state_dir(&self) -> PathBuf {
        self.state_dir().join("tmp")
    }

    pub fn downloads_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("downloads")
    }

    /// Cache location for a package, keyed by the SHA-256 of its store key so
    /// that arbitrary keys map to flat, filesystem-safe names.
    pub fn download_path(&self, key: &str, kind: ArchiveKind) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.downloads_cache_dir()
            .join(format!("{digest}.{}", kind.cache_extension()))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.state_dir(),
            self.cache_dir(),
            self.inventory_dir(),
            self.tmp_state_dir(),
            self.downloads_cache_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Creates a fresh scratch directory that is removed when the guard drops.
    pub fn make_work_dir(&self, prefix: &str) -> Result<WorkDir> {
        let mut dir = self.tmp_state_dir();
        dir.push(format!(
            "{}-{}-{}",
            prefix,
            std::process::id(),
            current_unix_timestamp()?
        ));
        let mut candidate = dir.clone();
        let mut suffix = 1_u32;
        while candidate.exists() {
            candidate = dir.with_extension(suffix.to_string());
            suffix += 1;
        }
        fs::create_dir_all(&candidate)
            .with_context(|| format!("failed creating tmp dir: {}", candidate.display()))?;
        Ok(WorkDir { path: candidate })
    }
}

pub fn default_user_prefix() -> Result<PathBuf> {
    if let Some(prefix) = std::env::var_os("APPKEEP_PREFIX").filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(prefix));
    }
    let home = std::env::var("HOME").context("HOME is not set; cannot resolve user prefix")?;
    Ok(PathBuf::from(home).join(".appkeep"))
}

#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to remove work dir"
                );
            }
        }
    }
}
