//! Configuration management for the job engine.
//!
//! Supports loading configuration from:
//! 1. Configuration files (YAML)
//! 2. Environment variables (with RELAY_ prefix)
//!
//! Configuration precedence (highest to lowest):
//! 1. Environment variables
//! 2. Configuration file
//! 3. Default values

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedResult;
use crate::persistence::{JobStore, JsonStore, SqliteStore};
use crate::retry::BackoffConfig;

/// File name of the SQLite database inside the store directory.
const SQLITE_FILE: &str = "jobs.db";

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of job bodies running at once
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Interval of the periodic eligibility sweep in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Retry backoff
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// How long shutdown waits for running jobs, in seconds
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Number of finished jobs whose final state is remembered for waiters
    #[serde(default = "default_terminal_cache_size")]
    pub terminal_cache_size: usize,

    /// Job store
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Job store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Storage backend type: "sqlite" or "json"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Directory holding the store
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_max_workers() -> usize {
    4
}

fn default_sweep_interval_ms() -> u64 {
    30_000
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_terminal_cache_size() -> usize {
    10_000
}

fn default_store_backend() -> String {
    "sqlite".to_string()
}

fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("relay")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_workers: default_max_workers(),
            sweep_interval_ms: default_sweep_interval_ms(),
            backoff: BackoffConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            terminal_cache_size: default_terminal_cache_size(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: default_store_backend(),
            path: default_store_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml_ng::from_str(contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables over the defaults.
    pub fn from_env() -> Self {
        EngineConfig::default().merge_env()
    }

    /// Load configuration with the following precedence:
    /// 1. Load from file if provided
    /// 2. Apply environment variable overrides
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        // Start with file or default
        let config = if let Some(path) = config_file {
            Self::from_file(path)?
        } else {
            EngineConfig::default()
        };

        let config = config.merge_env();
        config.validate()?;
        Ok(config)
    }

    /// Merge environment variables into this configuration.
    ///
    /// Only variables that are set override the current values.
    fn merge_env(self) -> Self {
        self.merge_vars(|key| std::env::var(key).ok())
    }

    fn merge_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        // Engine
        if let Some(val) = var("RELAY_MAX_WORKERS").and_then(|v| v.parse().ok()) {
            self.max_workers = val;
        }
        if let Some(val) = var("RELAY_SWEEP_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.sweep_interval_ms = val;
        }
        if let Some(val) = var("RELAY_SHUTDOWN_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.shutdown_timeout_secs = val;
        }
        if let Some(val) = var("RELAY_TERMINAL_CACHE_SIZE").and_then(|v| v.parse().ok()) {
            self.terminal_cache_size = val;
        }

        // Backoff
        if let Some(val) = var("RELAY_BACKOFF_BASE_MS").and_then(|v| v.parse().ok()) {
            self.backoff.base_ms = val;
        }
        if let Some(val) = var("RELAY_BACKOFF_MAX_MS").and_then(|v| v.parse().ok()) {
            self.backoff.max_ms = val;
        }
        if let Some(val) = var("RELAY_BACKOFF_JITTER").and_then(|v| v.parse().ok()) {
            self.backoff.jitter = val;
        }

        // Store
        if let Some(v) = var("RELAY_STORE_BACKEND") {
            self.store.backend = v;
        }
        if let Some(v) = var("RELAY_STORE_PATH") {
            self.store.path = PathBuf::from(v);
        }

        // Logging
        if let Some(v) = var("RELAY_LOG_LEVEL") {
            self.logging.level = v;
        }

        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ValidationError(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sweep_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.backoff.base_ms > self.backoff.max_ms {
            return Err(ConfigError::ValidationError(format!(
                "backoff.base_ms ({}) exceeds backoff.max_ms ({})",
                self.backoff.base_ms, self.backoff.max_ms
            )));
        }

        // Validate storage backend
        match self.store.backend.as_str() {
            "sqlite" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Unknown store backend: {other}"
                )));
            }
        }

        // Validate log level
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {other}"
                )));
            }
        }

        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl StoreConfig {
    /// Store backed by SQLite in `path`.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            backend: "sqlite".to_string(),
            path: path.into(),
        }
    }

    /// Store backed by JSON files in `path`.
    pub fn json(path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            backend: "json".to_string(),
            path: path.into(),
        }
    }

    /// Build the configured store, creating its directory if needed.
    pub async fn open(&self) -> SchedResult<Arc<dyn JobStore>> {
        tokio::fs::create_dir_all(&self.path).await?;

        match self.backend.as_str() {
            "sqlite" => {
                let store = SqliteStore::open(self.path.join(SQLITE_FILE))?;
                Ok(Arc::new(store))
            }
            "json" => {
                let store = JsonStore::new(&self.path).await?;
                Ok(Arc::new(store))
            }
            other => {
                Err(ConfigError::ValidationError(format!("Unknown store backend: {other}")).into())
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;
    use crate::job::{JobId, JobRecord, Parameters};
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.backoff.base_ms, 1_000);
        assert_eq!(config.backoff.max_ms, 60_000);
        assert!(config.backoff.jitter);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.store.backend, "sqlite");
        assert!(config.store.path.ends_with("relay"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_values() {
        let mut config = EngineConfig::default();
        config.store.backend = "postgres".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.backoff.base_ms = 120_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml() {
        let config = EngineConfig::from_yaml(
            r#"
max_workers: 2
backoff:
  base_ms: 50
store:
  backend: json
  path: /var/lib/relay
"#,
        )
        .unwrap();

        assert_eq!(config.max_workers, 2);
        assert_eq!(config.backoff.base_ms, 50);
        assert_eq!(config.backoff.max_ms, 60_000);
        assert_eq!(config.store, StoreConfig::json("/var/lib/relay"));
        assert_eq!(config.terminal_cache_size, 10_000);
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            EngineConfig::from_yaml("max_workers: [1, 2"),
            Err(ConfigError::ParseError(_))
        ));
        assert!(matches!(
            EngineConfig::from_yaml("max_workers: 0"),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RELAY_MAX_WORKERS", "8"),
            ("RELAY_BACKOFF_JITTER", "false"),
            ("RELAY_STORE_BACKEND", "json"),
            ("RELAY_LOG_LEVEL", "debug"),
            ("RELAY_SWEEP_INTERVAL_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::default()
            .merge_vars(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.max_workers, 8);
        assert!(!config.backoff.jitter);
        assert_eq!(config.store.backend, "json");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.sweep_interval_ms, 30_000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        std::fs::write(&path, "max_workers: 3\n").unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.max_workers, 3);

        assert!(matches!(
            EngineConfig::from_file(dir.path().join("missing.yaml")),
            Err(ConfigError::IoError(_))
        ));
    }

    #[tokio::test]
    async fn test_open_stores() {
        let dir = tempfile::tempdir().unwrap();
        let record = JobRecord::new(JobId::new(), 1, "SendJob", &Parameters::new(), Data::empty());

        for config in [
            StoreConfig::sqlite(dir.path().join("sqlite")),
            StoreConfig::json(dir.path().join("json")),
        ] {
            let store = config.open().await.unwrap();
            store.persist(&record).await.unwrap();
            assert_eq!(store.load_all_pending().await.unwrap().len(), 1);
        }

        let bogus = StoreConfig {
            backend: "memory".to_string(),
            path: dir.path().join("memory"),
        };
        assert!(bogus.open().await.is_err());
    }
}
