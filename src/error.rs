//! Error types for the registry.

use std::path::PathBuf;
use thiserror::Error;

use crate::storage::StorageError;

/// Errors from the script store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Stored scripts are corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Stored scripts use format version {found}, newest supported is {supported}")]
    UnsupportedVersion { found: u64, supported: u32 },

    #[error("Script '{0}' not found")]
    NotFound(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// The host refused or failed to run a script in a page.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InjectionError {
    #[error("Tab '{0}' is gone")]
    TabClosed(String),

    #[error("Injection rejected: {0}")]
    Rejected(String),
}

/// Errors from installing or refreshing scripts from a URL.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Only HTTPS URLs are supported: {0}")]
    InsecureUrl(String),

    #[error("A script from {0} already exists")]
    AlreadyInstalled(String),

    #[error("Script '{0}' has no update URL")]
    NoSourceUrl(String),

    #[error("Request to {url} timed out after {secs} seconds")]
    Timeout { url: String, secs: u64 },

    #[error("Failed to connect to {0}")]
    Connect(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {reason}")]
    Status { status: u16, reason: String },

    #[error("Expected JavaScript, got content-type: {0}")]
    ContentType(String),

    #[error("Script too large ({size} bytes, max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Downloaded file has no userscript metadata block")]
    MissingMetadata,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for installer operations.
pub type InstallResult<T> = Result<T, InstallError>;

/// Errors from loading the registry configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
