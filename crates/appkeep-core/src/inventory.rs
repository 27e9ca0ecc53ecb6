use serde::{Deserialize, Serialize};

use crate::normalize_name;

/// One installed application as recorded for an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub name: String,
    pub version: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    #[serde(default)]
    pub is_system_app: bool,
    pub installed_at_unix: u64,
    pub last_checked_at_unix: u64,
}

impl InventoryEntry {
    /// Case-insensitive, whitespace-normalized name. An identity's record holds
    /// at most one entry per key.
    pub fn key(&self) -> String {
        normalize_name(&self.name)
    }
}
