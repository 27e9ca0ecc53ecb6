use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comment-only frame that keeps an idle stream open.
pub const KEEPALIVE_FRAME: &str = ": keep-alive\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    PermissionDenied,
    FileNotFound,
    ProcessRunning,
    Cancelled,
    Timeout,
    InvalidPackage,
    NotFound,
    NoBundleFound,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PermissionDenied => "PermissionDenied",
            Self::FileNotFound => "FileNotFound",
            Self::ProcessRunning => "ProcessRunning",
            Self::Cancelled => "Cancelled",
            Self::Timeout => "Timeout",
            Self::InvalidPackage => "InvalidPackage",
            Self::NotFound => "NotFound",
            Self::NoBundleFound => "NoBundleFound",
            Self::Unknown => "Unknown",
        }
    }

    /// Human-readable message shown to the caller for this kind of failure.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission denied; re-run with sufficient privileges",
            Self::FileNotFound => "a required file or tool was not found",
            Self::ProcessRunning => {
                "the application is still running; close the application and try again"
            }
            Self::Cancelled => "the operation was cancelled",
            Self::Timeout => "the operation timed out",
            Self::InvalidPackage => "the package is invalid or unsupported",
            Self::NotFound => "the application could not be found",
            Self::NoBundleFound => "the package did not contain an installable application",
            Self::Unknown => "an unexpected error occurred",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event on an operation's progress stream.
///
/// For a single operation the `percent` values never decrease, and exactly one
/// terminal event (`Completed` or `Error`) ends the sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress {
        percent: u8,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    Completed {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    Error {
        message: String,
        kind: ErrorKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

impl ProgressEvent {
    pub fn progress(percent: u8, message: impl Into<String>) -> Self {
        Self::Progress {
            percent: percent.min(100),
            message: message.into(),
            details: None,
        }
    }

    pub fn progress_with(percent: u8, message: impl Into<String>, details: Value) -> Self {
        Self::Progress {
            percent: percent.min(100),
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn completed(message: impl Into<String>) -> Self {
        Self::Completed {
            message: message.into(),
            details: None,
        }
    }

    pub fn error(kind: ErrorKind, details: Option<String>) -> Self {
        Self::Error {
            message: kind.user_message().to_string(),
            kind,
            details,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }

    pub fn percent(&self) -> Option<u8> {
        match self {
            Self::Progress { percent, .. } => Some(*percent),
            Self::Completed { .. } => Some(100),
            Self::Error { .. } => None,
        }
    }

    /// Encodes the event as one wire frame: `data: <json>` followed by a blank line.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }

    /// Decodes a single frame produced by [`ProgressEvent::to_frame`].
    ///
    /// Returns `Ok(None)` for comment-only frames such as keep-alives.
    pub fn from_frame(frame: &str) -> Result<Option<Self>, serde_json::Error> {
        let mut payload = String::new();
        for line in frame.lines() {
            if let Some(data) = line.strip_prefix("data:") {
                payload.push_str(data.trim_start());
            }
        }
        if payload.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&payload).map(Some)
    }
}
