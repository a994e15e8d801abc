//! Configuration Management
//!
//! Two files live under the user config directory:
//! - `~/.config/quarry/settings.json`: backups location and reasoning service settings
//! - `~/.config/quarry/connections.json`: named connection profiles
//!
//! # Environment Overrides
//! - `QUARRY_BACKUPS_DIR`: backups root (default `<data_dir>/quarry/backups`)
//! - `QUARRY_AI_API_KEY` (or `ANTHROPIC_API_KEY`), `QUARRY_AI_MODEL`, `QUARRY_AI_BASE_URL`
//!
//! # Secrets
//! Profile passwords and connection strings are vault-encoded on `upsert` and decoded
//! on `resolve`. A profile may instead name an environment variable holding the
//! password (`password_env`), which then takes precedence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::engine::ConnectionConfig;
use crate::error::{QuarryError, Result};
use crate::nl::AnthropicReasoning;
use crate::vault::CredentialVault;

const APP_DIR: &str = "quarry";
pub const SETTINGS_FILE: &str = "settings.json";
pub const CONNECTIONS_FILE: &str = "connections.json";

/// Get path to the quarry config directory (`~/.config/quarry`)
pub fn config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| QuarryError::config_error("Could not determine user config directory"))?;
    Ok(dir.join(APP_DIR))
}

/// Get path to the quarry data directory (`~/.local/share/quarry`)
pub fn data_dir() -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .ok_or_else(|| QuarryError::config_error("Could not determine user data directory"))?;
    Ok(dir.join(APP_DIR))
}

/// Reasoning service settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Application settings (`settings.json`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root directory for backups and their manifests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backups_dir: Option<PathBuf>,

    pub ai: AiSettings,
}

impl Settings {
    /// Load settings from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| QuarryError::config_error(format!("Could not read settings file: {e}")))?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&contents)
            .map_err(|e| QuarryError::config_error(format!("Invalid settings file format: {e}")))
    }

    /// Settings from the default location with environment overrides applied
    pub fn load_default() -> Result<Self> {
        let mut settings = Self::load(&config_dir()?.join(SETTINGS_FILE))?;
        settings.apply_overrides(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
        Ok(settings)
    }

    /// Apply environment-style overrides from `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("QUARRY_BACKUPS_DIR") {
            self.backups_dir = Some(PathBuf::from(dir));
        }
        if let Some(key) = lookup("QUARRY_AI_API_KEY").or_else(|| lookup("ANTHROPIC_API_KEY")) {
            self.ai.api_key = Some(key);
        }
        if let Some(model) = lookup("QUARRY_AI_MODEL") {
            self.ai.model = Some(model);
        }
        if let Some(url) = lookup("QUARRY_AI_BASE_URL") {
            self.ai.base_url = Some(url);
        }
    }

    /// Configured backups root, or `<data_dir>/quarry/backups`
    pub fn backups_root(&self) -> Result<PathBuf> {
        match &self.backups_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("backups")),
        }
    }

    /// Reasoning client built from these settings
    pub fn reasoning_service(&self) -> Result<AnthropicReasoning> {
        let api_key = self.ai.api_key.clone().ok_or_else(|| {
            QuarryError::config_error("No reasoning service API key; set QUARRY_AI_API_KEY or ANTHROPIC_API_KEY")
        })?;
        AnthropicReasoning::new(api_key, self.ai.model.clone(), self.ai.base_url.clone())
    }
}

/// Stored connection profile
///
/// `ConnectionConfig` fields are flattened into the profile. `password` and
/// `connection_string` hold vault-encoded values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConnection {
    #[serde(flatten)]
    pub config: ConnectionConfig,

    /// Environment variable name for password (if not storing password directly)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Free-form environment tag (e.g. "production"), copied onto backup entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl StoredConnection {
    #[must_use]
    pub const fn new(config: ConnectionConfig) -> Self {
        Self { config, password_env: None, environment: None }
    }

    /// Decode secrets and resolve `password_env` into a usable config
    pub fn resolve(&self, vault: &CredentialVault) -> Result<ConnectionConfig> {
        let mut config = self.config.clone();

        if let Some(env_var) = &self.password_env {
            match std::env::var(env_var) {
                Ok(password) => config.password = Some(password),
                Err(_) => {
                    return Err(QuarryError::config_error(format!(
                        "Environment variable {env_var} not found for password"
                    )));
                }
            }
        } else if let Some(stored) = &self.config.password {
            config.password = Some(vault.decrypt(stored)?);
        }

        if let Some(stored) = &self.config.connection_string {
            config.connection_string = Some(vault.decrypt(stored)?);
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConnectionsFile {
    #[serde(default)]
    connections: BTreeMap<String, StoredConnection>,
}

/// Named connection profiles backed by `connections.json`
pub struct ConnectionStore {
    path: PathBuf,
    vault: CredentialVault,
    connections: BTreeMap<String, StoredConnection>,
}

impl ConnectionStore {
    /// Load profiles from `path`; a missing file yields an empty store
    pub fn load(path: impl Into<PathBuf>, vault: CredentialVault) -> Result<Self> {
        let path = path.into();
        let connections = if path.exists() {
            let contents = fs::read_to_string(&path)
                .map_err(|e| QuarryError::config_error(format!("Could not read config file: {e}")))?;
            if contents.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str::<ConnectionsFile>(&contents)
                    .map_err(|e| QuarryError::config_error(format!("Invalid connections file format: {e}")))?
                    .connections
            }
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), profiles = connections.len(), "connection profiles loaded");
        Ok(Self { path, vault, connections })
    }

    /// Profiles from the default location, secrets in the OS keychain
    pub fn load_default() -> Result<Self> {
        Self::load(config_dir()?.join(CONNECTIONS_FILE), CredentialVault::default())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write all profiles (temp file, then rename)
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                QuarryError::config_error(format!("Could not create config directory: {e}"))
            })?;
        }

        let file = ConnectionsFile { connections: self.connections.clone() };
        let contents = serde_json::to_string_pretty(&file)
            .map_err(|e| QuarryError::config_error(format!("Could not serialize config: {e}")))?;

        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, contents)
            .map_err(|e| QuarryError::config_error(format!("Could not write config file: {e}")))?;
        fs::rename(&temp, &self.path)
            .map_err(|e| QuarryError::config_error(format!("Could not replace config file: {e}")))
    }

    /// Insert or replace a profile; plaintext secrets in `stored` are vault-encoded
    pub fn upsert(&mut self, name: impl Into<String>, mut stored: StoredConnection) {
        if let Some(password) = stored.config.password.take() {
            stored.config.password = Some(self.vault.encrypt(&password));
        }
        if let Some(conn_str) = stored.config.connection_string.take() {
            stored.config.connection_string = Some(self.vault.encrypt(&conn_str));
        }
        self.connections.insert(name.into(), stored);
    }

    /// Remove a profile
    pub fn remove(&mut self, name: &str) -> Result<StoredConnection> {
        self.connections.remove(name).ok_or_else(|| not_found(name))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StoredConnection> {
        self.connections.get(name)
    }

    /// Profile with secrets decoded, ready to connect
    pub fn resolve(&self, name: &str) -> Result<ConnectionConfig> {
        self.get(name).ok_or_else(|| not_found(name))?.resolve(&self.vault)
    }

    /// Profiles in name order
    #[must_use]
    pub fn list(&self) -> Vec<(&str, &StoredConnection)> {
        self.connections.iter().map(|(k, v)| (k.as_str(), v)).collect()
    }
}

fn not_found(name: &str) -> QuarryError {
    QuarryError::not_found(format!(
        "Connection profile '{name}' not found. Run 'quarry connect' to create one."
    ))
}
