use std::io;
use std::path::PathBuf;

use appkeep_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("package '{0}' was not found in the store")]
    NotFound(String),
    #[error("invalid store key '{0}'")]
    InvalidKey(String),
    #[error("invalid identity '{0}'")]
    InvalidIdentity(String),
    #[error("{context}: {}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("request for '{key}' failed with status {status}")]
    Status { key: String, status: u16 },
    #[error("package store request failed")]
    Http(#[from] reqwest::Error),
    #[error("inventory record for '{identity}' is corrupt")]
    Corrupt {
        identity: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::InvalidKey(_) => ErrorKind::InvalidPackage,
            Self::Io { source, .. } => match source.kind() {
                io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                io::ErrorKind::NotFound => ErrorKind::FileNotFound,
                _ => ErrorKind::Unknown,
            },
            Self::Status { status, .. } if *status == 404 => ErrorKind::InvalidPackage,
            Self::Status { status, .. } if *status == 401 || *status == 403 => {
                ErrorKind::PermissionDenied
            }
            Self::Http(err) if err.is_timeout() => ErrorKind::Timeout,
            _ => ErrorKind::Unknown,
        }
    }
}
