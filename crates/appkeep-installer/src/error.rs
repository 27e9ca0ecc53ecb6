use std::fmt;
use std::io;

use appkeep_core::{ErrorKind, ProgressEvent};
use appkeep_store::StoreError;

use crate::command::CommandError;

/// A failed operation step, already classified into an [`ErrorKind`].
///
/// `message` is the user-facing template for the kind; `details` carries the
/// underlying cause for logs and the error event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<String>,
}

impl OperationError {
    pub fn new(kind: ErrorKind, details: impl Into<String>) -> Self {
        let details = details.into();
        Self {
            kind,
            message: kind.user_message().to_string(),
            details: (!details.is_empty()).then_some(details),
        }
    }

    pub fn from_io(context: &str, err: &io::Error) -> Self {
        Self::new(classify_io(err), format!("{context}: {err}"))
    }

    /// Classifies an internal error chain by the first I/O error it carries.
    pub fn from_anyhow(fallback: ErrorKind, err: &anyhow::Error) -> Self {
        let kind = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<io::Error>())
            .map(classify_io)
            .filter(|kind| *kind != ErrorKind::Unknown)
            .unwrap_or(fallback);
        Self::new(kind, format!("{err:#}"))
    }

    pub fn to_event(&self) -> ProgressEvent {
        ProgressEvent::Error {
            message: self.message.clone(),
            kind: self.kind,
            details: self.details.clone(),
        }
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{} ({})", self.message, details),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for OperationError {}

impl From<CommandError> for OperationError {
    fn from(err: CommandError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<StoreError> for OperationError {
    fn from(err: StoreError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

pub fn classify_io(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        io::ErrorKind::NotFound => ErrorKind::FileNotFound,
        io::ErrorKind::TimedOut => ErrorKind::Timeout,
        _ => match err.raw_os_error() {
            Some(code) if code == libc::EPERM || code == libc::EACCES => {
                ErrorKind::PermissionDenied
            }
            _ => ErrorKind::Unknown,
        },
    }
}
