use serde::{Deserialize, Serialize};

/// Package container formats the installer knows how to unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveKind {
    DiskImage,
    InstallerPackage,
    Zip,
}

impl ArchiveKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DiskImage => "dmg",
            Self::InstallerPackage => "pkg",
            Self::Zip => "zip",
        }
    }

    pub fn cache_extension(self) -> &'static str {
        self.as_str()
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "dmg" => Some(Self::DiskImage),
            "pkg" | "mpkg" => Some(Self::InstallerPackage),
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }

    pub fn infer_from_key(key: &str) -> Option<Self> {
        let without_fragment = key.split('#').next().unwrap_or(key);
        let without_query = without_fragment
            .split('?')
            .next()
            .unwrap_or(without_fragment);
        let file_name = without_query.rsplit('/').next().unwrap_or("");
        let (_, extension) = file_name.rsplit_once('.')?;
        Self::parse(extension)
    }
}
