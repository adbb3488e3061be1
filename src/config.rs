//! Registry configuration.
//!
//! Read from `config.toml` in the data directory. Every field is optional;
//! missing fields (or a missing file) fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Directory name under the platform data directory.
pub const APP_DIR_NAME: &str = "TamperTorn";

/// Config file name inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where scripts and this config live.
    pub data_dir: PathBuf,
    /// Storage key of the script collection.
    pub storage_key: String,
    pub fetch_timeout_secs: u64,
    pub max_script_bytes: usize,
    /// Minimum age before a remote script is re-fetched.
    pub update_interval_secs: u64,
    /// Minimum wait after a failed fetch before retrying.
    pub error_backoff_secs: u64,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            storage_key: crate::store::DEFAULT_STORAGE_KEY.to_string(),
            fetch_timeout_secs: 30,
            max_script_bytes: 10 * 1024 * 1024,
            update_interval_secs: 24 * 60 * 60,
            error_backoff_secs: 60 * 60,
            user_agent: format!("TamperTorn/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Platform data directory for the app, `./TamperTorn` if there is none.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

impl Config {
    /// Load from the default data directory.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_dir(&default_data_dir())
    }

    /// Load `config.toml` from `dir`. The returned config's `data_dir` is
    /// `dir` unless the file overrides it.
    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE_NAME);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Self {
                    data_dir: dir.to_path_buf(),
                    ..Self::default()
                });
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        let mut config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        if !content_sets_data_dir(&content) {
            config.data_dir = dir.to_path_buf();
        }
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn content_sets_data_dir(content: &str) -> bool {
    toml::from_str::<toml::Table>(content)
        .map(|table| table.contains_key("data_dir"))
        .unwrap_or(false)
}
