//! Engine configuration.
//!
//! YAML file loading with serde defaults, environment overrides, and a
//! validation pass. Every section is optional; an empty file (or no file at
//! all) yields the default paper-safe configuration.
//!
//! # Environment variables
//!
//! - `TILLER_CONFIG`: path to the config file (default: `config.yaml`)
//! - `TILLER_DRY_RUN`: `1`/`true` forces broker dry-run mode regardless of
//!   the file

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::RetryPolicy;
use crate::risk::RiskConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse the YAML document.
    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("config validation failed: {0}")]
    Validation(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Broker configuration.
    #[serde(default)]
    pub broker: BrokerSettings,
    /// Risk manager configuration.
    #[serde(default)]
    pub risk: RiskConfig,
    /// OCO reconciliation configuration.
    #[serde(default)]
    pub oco: OcoSettings,
    /// TWAP execution configuration.
    #[serde(default)]
    pub twap: TwapSettings,
    /// Persistence configuration.
    #[serde(default)]
    pub store: StoreSettings,
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Simulate order placement locally instead of calling the exchange.
    #[serde(default)]
    pub dry_run: bool,
    /// Retry policy for adapter calls.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            dry_run: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// OCO reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcoSettings {
    /// Seconds between reconciliation passes.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

fn default_reconcile_interval_secs() -> u64 {
    5
}

impl Default for OcoSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

impl OcoSettings {
    /// Reconciliation interval as a duration.
    #[must_use]
    pub const fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// TWAP execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwapSettings {
    /// Per-slice retry policy for background jobs.
    #[serde(default = "RetryPolicy::twap")]
    pub retry: RetryPolicy,
}

impl Default for TwapSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::twap(),
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Path to the SQLite database file.
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "tiller.db".to_string()
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file, apply environment overrides, and
    /// validate.
    ///
    /// Resolution order for the path: explicit argument, `TILLER_CONFIG`,
    /// then `config.yaml` when it exists; otherwise defaults are used.
    ///
    /// # Errors
    ///
    /// Read, parse, or validation failures.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match Self::resolve_path(path) {
            Some(path) => {
                let text =
                    std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                        path: path.display().to_string(),
                        source,
                    })?;
                serde_yaml_bw::from_str(&text)?
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("TILLER_DRY_RUN") {
            let enabled = matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
            if enabled {
                self.broker.dry_run = true;
            }
        }
    }

    /// Validate structural constraints.
    ///
    /// Risk-specific rules (cap >= 1, non-negative percentages) are enforced
    /// again by the risk manager at construction; this pass fails fast at
    /// load time.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] with the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.retry.max_attempts < 1 {
            return Err(ConfigError::Validation(
                "broker.retry.max_attempts must be >= 1".to_string(),
            ));
        }
        if self.twap.retry.max_attempts < 1 {
            return Err(ConfigError::Validation(
                "twap.retry.max_attempts must be >= 1".to_string(),
            ));
        }
        if self.oco.reconcile_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "oco.reconcile_interval_secs must be >= 1".to_string(),
            ));
        }
        if self.risk.max_concurrent_deals < 1 {
            return Err(ConfigError::Validation(
                "risk.max_concurrent_deals must be >= 1".to_string(),
            ));
        }
        if self.store.path.is_empty() {
            return Err(ConfigError::Validation(
                "store.path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn resolve_path(explicit: Option<&Path>) -> Option<std::path::PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var("TILLER_CONFIG") {
            return Some(path.into());
        }
        let default = Path::new("config.yaml");
        default.exists().then(|| default.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.broker.dry_run);
        assert_eq!(config.risk.max_concurrent_deals, 3);
        assert_eq!(config.oco.reconcile_interval_secs, 5);
        assert_eq!(config.store.path, "tiller.db");
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "broker:\n  dry_run: true\nrisk:\n  max_concurrent_deals: 7\n"
        )
        .unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert!(config.broker.dry_run);
        assert_eq!(config.risk.max_concurrent_deals, 7);
        // Untouched sections keep defaults.
        assert_eq!(config.oco.reconcile_interval_secs, 5);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = EngineConfig {
            oco: OcoSettings {
                reconcile_interval_secs: 0,
            },
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = EngineConfig::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
