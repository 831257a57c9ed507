//! Mount configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MountConfig {
    /// Byte offset of the NTFS partition on the block device.
    pub partition_offset: u64,
    /// List entries carrying the hidden attribute.
    pub show_hidden_files: bool,
    /// List entries carrying the system attribute, and NTFS metafiles.
    pub show_system_files: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            partition_offset: 0,
            show_hidden_files: true,
            show_system_files: false,
        }
    }
}

impl MountConfig {
    /// Get the user config directory path
    pub fn user_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rusty-ntfs"))
    }

    /// Get the user config file path
    pub fn user_config_path() -> Option<PathBuf> {
        Self::user_config_dir().map(|dir| dir.join("config.json"))
    }

    /// Load configuration from config.json
    pub fn load() -> Self {
        // Try to load from user config directory first (highest priority)
        if let Some(user_config) = Self::user_config_path() {
            if let Ok(config) = Self::load_from_path(&user_config) {
                return config;
            }
        }

        // Try to load from current directory
        if let Ok(config) = Self::load_from_path("config.json") {
            return config;
        }

        Self::default()
    }

    /// Save configuration to user config directory
    pub fn save(&self) -> Result<()> {
        let config_dir =
            Self::user_config_dir().context("could not determine user config directory")?;
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("creating {}", config_dir.display()))?;
        self.save_to_path(config_dir.join("config.json"))
    }

    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: MountConfig = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }
}
