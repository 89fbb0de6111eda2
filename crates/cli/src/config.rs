//! Configuration loading from warden.toml.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use engine::{DEFAULT_ACTIVITY_LOG_LIMIT, EngineOptions};
use permissions::{CaveatType, ExclusionMap, MergePolicy, MergeStrategy};
use serde::Deserialize;

/// Top-level configuration. Every section is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub wallet: WalletConfig,
    pub permissions: PermissionsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file. Defaults to `warden.db` in the platform data dir.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Accounts the host reports as held by the wallet.
    pub accounts: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    pub revoke_on_disconnect: bool,
    pub activity_log_limit: usize,
    /// Target name to the reason it is unavailable.
    pub exclusions: ExclusionMap,
    /// Caveat type to merge strategy, overriding the built-in table.
    pub merge: BTreeMap<String, MergeStrategy>,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            revoke_on_disconnect: false,
            activity_log_limit: DEFAULT_ACTIVITY_LOG_LIMIT,
            exclusions: ExclusionMap::new(),
            merge: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "warn".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string.
    ///
    /// Merge overrides are checked here, so a bad strategy is reported
    /// before any operation runs.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.merge_policy()?;
        Ok(config)
    }

    /// The merge policy table with configured overrides applied.
    pub fn merge_policy(&self) -> Result<MergePolicy, ConfigError> {
        self.permissions
            .merge
            .iter()
            .try_fold(MergePolicy::default(), |policy, (ty, strategy)| {
                policy
                    .with_strategy(CaveatType::from(ty.as_str()), *strategy)
                    .map_err(|e| ConfigError::MergePolicy(e.to_string()))
            })
    }

    pub fn engine_options(&self, connected: &str, disconnected: &str) -> EngineOptions {
        EngineOptions {
            revoke_on_disconnect: self.permissions.revoke_on_disconnect,
            activity_log_limit: self.permissions.activity_log_limit,
            ..EngineOptions::default().with_connection_events(connected, disconnected)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid merge override: {0}")]
    MergePolicy(String),
}
