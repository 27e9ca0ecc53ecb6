use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ArchiveKind;

const TRAILING_QUALIFIERS: &[&str] = &[
    "arm", "arm64", "aarch64", "x64", "x86", "amd64", "intel", "universal", "universal2", "mac",
    "macos", "osx", "darwin", "installer", "setup", "latest",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("package reference must not be empty")]
    Empty,
    #[error("package reference '{0}' does not name a file")]
    MissingFileName(String),
    #[error("package reference '{key}' has unsupported extension '{extension}'")]
    UnsupportedExtension { key: String, extension: String },
}

/// A remotely stored package and the names derived from its key.
///
/// `display_name` is the file stem of the key. `search_name` is the display
/// name with trailing version and architecture tokens removed; it is what the
/// installer matches against bundles and running processes, and it is never
/// empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageReference {
    pub key: String,
    pub display_name: String,
    pub search_name: String,
    pub archive_kind: ArchiveKind,
    pub version_hint: Option<String>,
}

impl PackageReference {
    pub fn parse(key: &str) -> Result<Self, ReferenceError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let without_fragment = key.split('#').next().unwrap_or(key);
        let without_query = without_fragment
            .split('?')
            .next()
            .unwrap_or(without_fragment);
        let file_name = without_query.rsplit('/').next().unwrap_or("").trim();
        let Some((stem, extension)) = file_name.rsplit_once('.') else {
            return Err(ReferenceError::MissingFileName(key.to_string()));
        };
        let display_name = stem.trim();
        if display_name.is_empty() {
            return Err(ReferenceError::MissingFileName(key.to_string()));
        }

        let archive_kind =
            ArchiveKind::parse(extension).ok_or_else(|| ReferenceError::UnsupportedExtension {
                key: key.to_string(),
                extension: extension.to_string(),
            })?;

        let (search_name, version_hint) = derive_search_name(display_name);
        Ok(Self {
            key: key.to_string(),
            display_name: display_name.to_string(),
            search_name,
            archive_kind,
            version_hint,
        })
    }

    /// File name the package is stored under locally.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.display_name, self.archive_kind.as_str())
    }
}

fn is_separator(ch: char) -> bool {
    matches!(ch, '-' | '_' | ' ')
}

fn is_version_token(token: &str) -> bool {
    let body = token
        .strip_prefix('v')
        .or_else(|| token.strip_prefix('V'))
        .unwrap_or(token);
    body.chars().next().is_some_and(|ch| ch.is_ascii_digit())
        && body.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '.')
}

fn is_qualifier_token(token: &str) -> bool {
    TRAILING_QUALIFIERS.contains(&token.to_ascii_lowercase().as_str())
}

pub(crate) fn derive_search_name(display_name: &str) -> (String, Option<String>) {
    let mut tokens = Vec::new();
    let mut start = None;
    for (idx, ch) in display_name.char_indices() {
        match (is_separator(ch), start) {
            (true, Some(begin)) => {
                tokens.push((begin, &display_name[begin..idx]));
                start = None;
            }
            (false, None) => start = Some(idx),
            _ => {}
        }
    }
    if let Some(begin) = start {
        tokens.push((begin, &display_name[begin..]));
    }

    let mut cut = tokens.len();
    let mut version_hint = None;
    while cut > 1 {
        let (_, token) = tokens[cut - 1];
        if is_version_token(token) {
            version_hint = Some(token.trim_start_matches(['v', 'V']).to_string());
        } else if !is_qualifier_token(token) {
            break;
        }
        cut -= 1;
    }

    let search_name = match tokens.get(cut) {
        Some((offset, _)) => display_name[..*offset].trim_end_matches(is_separator),
        None => display_name.trim_end_matches(is_separator),
    };
    let search_name = if search_name.is_empty() {
        tokens
            .first()
            .map(|(_, token)| *token)
            .unwrap_or(display_name)
    } else {
        search_name
    };

    (search_name.to_string(), version_hint)
}
