use std::path::PathBuf;
use shared::MacAddr;
use thiserror::Error;

/// The DHCP server could not produce a snapshot.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("login failed: {0}")]
    Login(String),

    #[error("remote command failed: {0}")]
    Remote(String),

    #[error("failed to parse lease data: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    /// Inserting a MAC that is already stored means the diff logic is broken
    #[error("duplicate inventory key {0}")]
    DuplicateKey(MacAddr),

    #[error("inventory table {0} uses an older layout; run `update` to migrate it")]
    NeedsMigration(String),

    #[error("MAC address {0} not found in the inventory")]
    NotFound(MacAddr),

    #[error("inventory thread is gone")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Vendor lookup miss. Never escapes the vendor module; callers get the sentinel.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("vendor lookup request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vendor lookup returned {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("DHCP source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),

    #[error("inventory error: {0}")]
    Store(#[from] StoreError),
}

impl ReconcileError {
    pub fn is_fatal(&self) -> bool {
        match self {
            ReconcileError::Store(e) => e.is_fatal(),
            ReconcileError::SourceUnavailable(_) => false,
        }
    }
}
