//! Cross-platform application paths
//!
//! - Linux: ~/.local/share/neuroloop/
//! - Windows: %APPDATA%\neuroloop\
//! - MacOS: ~/Library/Application Support/neuroloop/

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: PathBuf,
}

impl AppPaths {
    /// Resolve the per-user data directory and make sure it exists.
    pub fn new() -> Result<Self, ConfigError> {
        let base = dirs::data_dir().ok_or(ConfigError::NoDataDir)?;
        Self::at(base.join("neuroloop"))
    }

    /// Rooted at an explicit directory (tests, portable installs).
    pub fn at(data_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(|source| ConfigError::CreateDir {
            path: data_dir.clone(),
            source,
        })?;
        Ok(Self { data_dir })
    }

    /// Where the data directory would be, without creating it.
    pub fn default_config_file() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("neuroloop").join("config.json"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    /// Console-side recording of every frame sent and received.
    pub fn session_log_file(&self) -> PathBuf {
        self.data_dir.join("session.jsonl")
    }

    /// Backend-side data log written by `neuroloopd`.
    pub fn backend_log_file(&self) -> PathBuf {
        self.data_dir.join("neuroloopd.jsonl")
    }
}
