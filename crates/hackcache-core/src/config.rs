//! Application configuration management.
//!
//! Holds the server base URL, request timeout, an optional cache directory
//! override, the last used username and the push registration settings.
//!
//! Configuration is stored at `~/.config/hackcache/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::DurableFile;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "hackcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_BASE_URL: &str = "https://mhacks.org";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Push preference bit set meaning "every category"
pub const DEFAULT_PUSH_PREFERENCE: u32 = 63;

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub last_username: Option<String>,
    #[serde(default)]
    pub push_device_token: Option<String>,
    #[serde(default)]
    pub push_preference: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            cache_dir: None,
            last_username: None,
            push_device_token: None,
            push_preference: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(serde_json::from_str(&contents)
                .with_context(|| format!("Invalid config file {}", path.display()))?)
        } else {
            Ok(Self::default())
        }
    }

    /// Write this config as pretty JSON through `file`, normally to
    /// `config_path()`.
    pub fn save_to(&self, file: &dyn DurableFile, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        file.write_all(path, contents.as_bytes())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn push_preference(&self) -> u32 {
        self.push_preference.unwrap_or(DEFAULT_PUSH_PREFERENCE)
    }
}
