//! Cache configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (STOW_*)
//! 2. TOML config file (if STOW_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Cache configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (STOW_*)
/// 2. TOML config file (if STOW_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Path to the SQLite cache database. The in-process map is used when unset.
    ///
    /// Set via STOW_DB_PATH environment variable.
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Only persist responses for their remaining freshness lifetime.
    ///
    /// Set via STOW_STRICT_TTL environment variable.
    #[serde(default)]
    pub strict_ttl: bool,

    /// Upper bound for the TTL handed to storage, in milliseconds.
    ///
    /// Set via STOW_MAX_TTL_MS environment variable.
    #[serde(default)]
    pub max_ttl_ms: Option<u64>,

    /// Fall back to the network when storage fails during lookup.
    ///
    /// Set via STOW_AUTOMATIC_FAILOVER environment variable.
    #[serde(default)]
    pub automatic_failover: bool,

    /// Largest response body that is buffered for storage.
    ///
    /// Set via STOW_MAX_BODY_BYTES environment variable.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// User-Agent string for the bundled HTTP transport.
    ///
    /// Set via STOW_USER_AGENT environment variable.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Transport request timeout in milliseconds.
    ///
    /// Set via STOW_TIMEOUT_MS environment variable.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum redirects followed by the bundled HTTP transport.
    ///
    /// Set via STOW_MAX_REDIRECTS environment variable.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

fn default_max_body_bytes() -> usize {
    5_242_880 // 5MB
}

fn default_user_agent() -> String {
    "stow/0.1".into()
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_max_redirects() -> usize {
    5
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            strict_ttl: false,
            max_ttl_ms: None,
            automatic_failover: false,
            max_body_bytes: default_max_body_bytes(),
            user_agent: default_user_agent(),
            timeout_ms: default_timeout_ms(),
            max_redirects: default_max_redirects(),
        }
    }
}

impl CacheConfig {
    /// Timeout as Duration for use with reqwest/tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Maximum TTL as Duration, if configured.
    pub fn max_ttl(&self) -> Option<Duration> {
        self.max_ttl_ms.map(Duration::from_millis)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `STOW_`
    /// 2. TOML file from `STOW_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("STOW_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("STOW_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}
