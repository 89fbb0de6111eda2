//! CLI error types.

use thiserror::Error;

use crate::config::ConfigError;

/// CLI errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration is invalid or unreadable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A JSON argument could not be parsed.
    #[error("invalid {what}: {source}")]
    InvalidJson {
        what: &'static str,
        source: serde_json::Error,
    },

    /// A value could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No data directory could be determined and no storage path is set.
    #[error("no data directory found; set storage.path in warden.toml")]
    NoDataDir,

    /// An error occurred in the enforcement engine.
    #[error(transparent)]
    Engine(#[from] engine::Error),

    /// An error occurred in the permission layer.
    #[error(transparent)]
    Permission(#[from] permissions::Error),

    /// An error occurred while wiring the host messenger.
    #[error(transparent)]
    Messenger(#[from] messenger::Error),

    /// An error occurred in the storage layer.
    #[error(transparent)]
    Storage(#[from] storage::Error),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
