//! Persisted backend settings.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;

const APP_DIR: &str = "agent-sessions";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not find config directory")]
    NoConfigDir,
}

/// Settings shared by every backend kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    /// Executable override; takes precedence over env and PATH lookup.
    pub cli_path: Option<PathBuf>,
    pub discovery_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub default_model: Option<String>,
    pub default_permission_mode: String,
    /// Capacity of each session's broadcast channels.
    pub event_buffer: usize,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            cli_path: None,
            discovery_timeout_secs: 15,
            handshake_timeout_secs: 30,
            default_model: None,
            default_permission_mode: "default".to_string(),
            event_buffer: 256,
        }
    }
}

impl BackendSettings {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Reads settings from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let dir = path.parent().ok_or(ConfigError::NoConfigDir)?;
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(self)?;

        // Write to temp file, then atomic rename
        let mut temp_file = NamedTempFile::new_in(dir)?;
        temp_file.write_all(content.as_bytes())?;
        temp_file.persist(path).map_err(|e| ConfigError::Io(e.error))?;
        Ok(())
    }

    /// Loads from the default location, falling back to defaults on any error.
    pub fn load() -> Self {
        let path = match settings_path() {
            Ok(path) => path,
            Err(err) => {
                log::warn!("[config] {}; using default settings", err);
                return Self::default();
            }
        };
        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(err) => {
                log::warn!(
                    "[config] Failed to load {}: {}; using default settings",
                    path.display(),
                    err
                );
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&settings_path()?)
    }
}

pub fn settings_path() -> Result<PathBuf, ConfigError> {
    Ok(dirs::config_dir()
        .ok_or(ConfigError::NoConfigDir)?
        .join(APP_DIR)
        .join(SETTINGS_FILE))
}
