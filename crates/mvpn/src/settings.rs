//! CLI Settings
//!
//! TOML config read from `~/.config/mvpn/config.toml` (or the platform
//! equivalent). Every field has a default, so a missing file just means
//! defaults; a config file passed explicitly with `--config` must exist.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use mvpn_core::ManagerConfig;

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Control plane base URL
    pub api_url: String,
    /// Bearer token for the control plane
    pub token: Option<String>,
    /// Tunnel interface name
    pub interface: String,
    pub permission_timeout_secs: u64,
    pub assign_timeout_secs: u64,
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8000".to_string(),
            token: None,
            interface: "mvpn0".to_string(),
            permission_timeout_secs: 60,
            assign_timeout_secs: 10,
            start_timeout_secs: 30,
            stop_timeout_secs: 10,
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mvpn").join("config.toml"))
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            permission_timeout: Duration::from_secs(self.permission_timeout_secs),
            assign_timeout: Duration::from_secs(self.assign_timeout_secs),
            start_timeout: Duration::from_secs(self.start_timeout_secs),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
        }
    }
}
