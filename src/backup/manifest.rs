//! Backup manifest persistence
//!
//! One manifest per connection at `<backups_root>/<connection_id>/manifest.json`:
//!
//! ```json
//! { "version": 1, "entries": [ { "id": "...", "connectionId": "...", ... } ] }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::DatabaseType;
use crate::error::{QuarryError, Result};

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.json";

/// One completed backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    /// Random v4 UUID
    pub id: String,
    pub connection_id: String,
    pub connection_name: String,
    pub engine: DatabaseType,
    pub database: String,
    pub created_at: DateTime<Utc>,
    /// Absolute path of the backup file
    pub file_path: PathBuf,
    /// Size in bytes at creation time
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: u32,
    #[serde(default)]
    pub entries: Vec<BackupEntry>,
}

impl Default for BackupManifest {
    fn default() -> Self {
        Self { version: MANIFEST_VERSION, entries: Vec::new() }
    }
}

impl BackupManifest {
    /// Load a manifest; a missing file is an empty manifest
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            QuarryError::config_error(format!("Failed to read backup manifest {}: {e}", path.display()))
        })?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&contents).map_err(|e| {
            QuarryError::config_error(format!("Invalid backup manifest {}: {e}", path.display()))
        })
    }

    /// Write through a temp file and rename so readers never see a torn manifest
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                QuarryError::config_error(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| QuarryError::config_error(format!("Failed to serialize backup manifest: {e}")))?;

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, json).map_err(|e| {
            QuarryError::config_error(format!("Failed to write {}: {e}", temp_path.display()))
        })?;
        fs::rename(&temp_path, path).map_err(|e| {
            QuarryError::config_error(format!("Failed to replace {}: {e}", path.display()))
        })
    }

    #[must_use]
    pub fn find(&self, backup_id: &str) -> Option<&BackupEntry> {
        self.entries.iter().find(|e| e.id == backup_id)
    }
}
