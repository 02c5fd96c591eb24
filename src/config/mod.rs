//! Configuration parsing module
//!
//! Handles the JSON5 settings file for the API gateway: port and bind mode,
//! the allowed-network gate, and the action access-control overlay.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::server::bind::DEFAULT_PORT;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },
}

/// Top-level settings document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api: ApiSettings,
    pub log: LogSettings,
}

/// Settings for the API server itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// TCP port the server binds when enabled.
    pub port: u16,
    /// Bind mode: "loopback" (default) or "lan".
    pub bind: String,
    /// SSIDs the server may run on. Empty means any network.
    pub allowed_networks: Vec<String>,
    /// Actions and groups barred from API access.
    pub remove_access: RemoveAccess,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: "loopback".to_string(),
            allowed_networks: Vec::new(),
            remove_access: RemoveAccess::default(),
        }
    }
}

/// Access-control overlay applied to the action registry at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoveAccess {
    pub actions: Vec<String>,
    pub action_groups: Vec<String>,
    pub group_actions: HashMap<String, Vec<String>>,
}

/// Logging section of the settings file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    /// "plaintext" or "json".
    pub format: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plaintext".to_string(),
        }
    }
}

/// Get the config file path.
/// Priority: INKGATE_CONFIG_PATH > INKGATE_STATE_DIR/inkgate.json5 > ~/.inkgate/inkgate.json5
/// Falls back to .json extension if the .json5 file doesn't exist.
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var("INKGATE_CONFIG_PATH") {
        return PathBuf::from(path);
    }

    if let Ok(state_dir) = env::var("INKGATE_STATE_DIR") {
        let dir = PathBuf::from(state_dir);
        let json5 = dir.join("inkgate.json5");
        if json5.exists() {
            return json5;
        }
        return dir.join("inkgate.json");
    }

    let base = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".inkgate");
    let json5 = base.join("inkgate.json5");
    if json5.exists() {
        return json5;
    }
    base.join("inkgate.json")
}

/// Load and parse the settings file.
/// Returns defaults if the file doesn't exist.
pub fn load_settings() -> Result<Settings, ConfigError> {
    load_settings_from(&get_config_path())
}

/// Load settings from an explicit path. Missing file yields defaults.
pub fn load_settings_from(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    parse_settings(&content, path)
}

fn parse_settings(content: &str, path: &Path) -> Result<Settings, ConfigError> {
    json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
