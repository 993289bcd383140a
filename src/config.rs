use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::sync::SyncSettings;

/// Default configuration file, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "treadi.yaml";

/// Prefix of environment variable overrides, e.g. `TREADI_SYNC__PAGE_SIZE`
pub const ENV_PREFIX: &str = "TREADI_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncSettings,
    pub logging: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid repos_per_query: {0}. Must be between 1 and 100")]
    InvalidReposPerQuery(usize),

    #[error("Invalid page_size: {0}. Must be between 1 and 100")]
    InvalidPageSize(u32),

    #[error("Invalid search_repos_per_query: {0}. Must be between 1 and 50")]
    InvalidSearchReposPerQuery(usize),

    #[error("Invalid poll_interval_secs: {0}. Must be at least 1")]
    InvalidPollInterval(u64),

    #[error(
        "Invalid backoff configuration: max_poll_backoff_secs ({1}) must be at least poll_interval_secs ({0})"
    )]
    InvalidPollBackoff(u64, u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `path`, or `treadi.yaml` in the working directory (optional)
    /// 3. Environment variables (`TREADI_` prefix, `__` separates sections)
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        if path.is_some() && !file.exists() {
            anyhow::bail!("Config file {} does not exist", file.display());
        }

        let config: Config = Self::figment(file)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a file only, ignoring the environment
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Self::figment(path.as_ref())
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment(file: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(file))
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let sync = &config.sync;

        if sync.repos_per_query == 0 || sync.repos_per_query > 100 {
            return Err(ConfigError::InvalidReposPerQuery(sync.repos_per_query));
        }
        if sync.page_size == 0 || sync.page_size > 100 {
            return Err(ConfigError::InvalidPageSize(sync.page_size));
        }
        if sync.search_repos_per_query == 0 || sync.search_repos_per_query > 50 {
            return Err(ConfigError::InvalidSearchReposPerQuery(
                sync.search_repos_per_query,
            ));
        }
        if sync.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidPollInterval(sync.poll_interval_secs));
        }
        if sync.max_poll_backoff_secs < sync.poll_interval_secs {
            return Err(ConfigError::InvalidPollBackoff(
                sync.poll_interval_secs,
                sync.max_poll_backoff_secs,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        Ok(())
    }
}
