//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::alerts::AlertConfig;
use crate::error::{Result, TollgateError};
use crate::ratelimit::{AdmissionMode, TierTable, TiersConfig};

/// Prefix for environment overrides, e.g. `TOLLGATE__TIERS__FREE__DAILY_LIMIT=50`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Per-tier limits
    #[serde(default)]
    pub tiers: TiersConfig,

    /// How requests are checked and counted
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Alert thresholds and sweep cadence
    #[serde(default)]
    pub alerts: AlertConfig,

    /// Counter store backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Admission configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Split (check, then record) or strict (atomic check-and-reserve)
    #[serde(default)]
    pub mode: AdmissionMode,

    /// Bound on every counter store call in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            mode: AdmissionMode::default(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl AdmissionConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_store_timeout_ms() -> u64 {
    250
}

/// Which counter store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL, required for postgres
    #[serde(default)]
    pub url: Option<String>,

    /// Connection pool size for postgres
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file plus `TOLLGATE__*`
    /// environment overrides, then validate it.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::with_name(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path, without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that would otherwise fail at runtime.
    pub fn validate(&self) -> Result<()> {
        self.tier_table()?;
        self.alerts.validate()?;

        if self.admission.store_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "admission.store_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.store.backend == StoreBackend::Postgres {
            if self.store.url.as_deref().is_none_or(str::is_empty) {
                return Err(TollgateError::Config(
                    "store.url is required for the postgres backend".into(),
                ));
            }
            if self.store.max_connections == 0 {
                return Err(TollgateError::Config(
                    "store.max_connections must be greater than zero".into(),
                ));
            }
        }
        Ok(())
    }

    /// The validated tier lookup table.
    pub fn tier_table(&self) -> Result<TierTable> {
        TierTable::from_config(&self.tiers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Limit, Tier};
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_match_builtin_tiers() {
        let config = TollgateConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.tier_table().unwrap(), TierTable::default());
        assert_eq!(config.admission.mode, AdmissionMode::Split);
        assert_eq!(config.admission.store_timeout(), Duration::from_millis(250));
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
tiers:
  free: { DAILY_LIMIT: 50, HOURLY_LIMIT: 10, BURST_LIMIT: 3, WINDOW_SIZE: 30000 }
  api_key: { DAILY_LIMIT: -1, HOURLY_LIMIT: 1000, BURST_LIMIT: 100, WINDOW_SIZE: 60000 }
admission:
  mode: strict
logging:
  level: debug
  json: true
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        let table = config.tier_table().unwrap();

        let free = table.limits(Tier::Free);
        assert_eq!(free.daily, Limit::Finite(50));
        assert_eq!(free.burst, 3);
        assert_eq!(free.burst_window, Duration::from_secs(30));

        let api = table.limits(Tier::ApiKey);
        assert_eq!(api.daily, Limit::Unlimited);
        assert_eq!(api.hourly, Limit::Finite(1000));

        assert_eq!(config.admission.mode, AdmissionMode::Strict);
        assert_eq!(config.admission.store_timeout_ms, 250);
        assert!(config.logging.json);
    }

    #[test]
    fn test_lowercase_keys_are_accepted() {
        let yaml = r#"
tiers:
  free: { daily_limit: 10, hourly_limit: 5, burst_limit: 2, window_size: 1000 }
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.tier_table().unwrap().limits(Tier::Free).daily,
            Limit::Finite(10)
        );
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let negative_burst = r#"
tiers:
  free: { DAILY_LIMIT: 100, HOURLY_LIMIT: 20, BURST_LIMIT: -1, WINDOW_SIZE: 60000 }
"#;
        assert!(matches!(
            TollgateConfig::from_yaml(negative_burst),
            Err(TollgateError::Config(_))
        ));

        let zero_window = r#"
tiers:
  api_key: { DAILY_LIMIT: -1, HOURLY_LIMIT: -1, BURST_LIMIT: 100, WINDOW_SIZE: 0 }
"#;
        assert_err!(TollgateConfig::from_yaml(zero_window));

        let postgres_without_url = "store:\n  backend: postgres\n";
        assert_err!(TollgateConfig::from_yaml(postgres_without_url));

        let bad_mode = "admission:\n  mode: eventually\n";
        assert_err!(TollgateConfig::from_yaml(bad_mode));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("tollgate-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "tiers:\n  free: { DAILY_LIMIT: 42, HOURLY_LIMIT: 7, BURST_LIMIT: 4, WINDOW_SIZE: 60000 }\n",
        )
        .unwrap();

        let config = TollgateConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).unwrap();

        let free = *config.tier_table().unwrap().limits(Tier::Free);
        assert_eq!(free.daily, Limit::Finite(42));
        assert_eq!(free.hourly, Limit::Finite(7));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TollgateConfig::load(None).unwrap();
        assert_eq!(config.tiers, TiersConfig::default());
    }
}
