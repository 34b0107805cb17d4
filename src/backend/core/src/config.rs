//! Configuration management.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::events::{EventStore, InMemoryEventStore, SqliteEventStore, DEFAULT_SUBSCRIPTION_BUFFER};
use crate::telemetry::LoggingConfig;

/// Prefix of environment overrides, e.g. `PETRI__STORE__URL`.
const ENV_PREFIX: &str = "PETRI";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// SQLite connection URL, ignored by the memory backend
    #[serde(default = "default_url")]
    pub url: String,

    /// Pool size for file databases
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Per-subscriber queue capacity
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_url(),
            max_connections: default_max_connections(),
            acquire_timeout: default_acquire_timeout(),
            subscription_buffer: default_subscription_buffer(),
        }
    }
}

impl StoreConfig {
    /// Open the configured backend.
    pub async fn open(&self) -> Result<Arc<dyn EventStore>> {
        info!(backend = ?self.backend, "opening event store");
        Ok(match self.backend {
            StoreBackend::Memory => Arc::new(InMemoryEventStore::with_buffer(self.subscription_buffer)),
            StoreBackend::Sqlite => Arc::new(SqliteEventStore::connect_with(self).await?),
        })
    }
}

/// Open the backend selected by `config`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn EventStore>> {
    config.open().await
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Save a snapshot every N events per aggregate; `None` disables snapshots
    #[serde(default)]
    pub snapshot_interval: Option<u64>,

    /// Attempts made by `execute_with_retry` on concurrency conflicts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Evaluate state constraints after each action
    #[serde(default = "default_check_constraints")]
    pub check_constraints: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: None,
            max_retries: default_max_retries(),
            check_constraints: default_check_constraints(),
        }
    }
}

// Default value functions
fn default_url() -> String { "sqlite::memory:".to_string() }
fn default_max_connections() -> u32 { 5 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(30) }
fn default_subscription_buffer() -> usize { DEFAULT_SUBSCRIPTION_BUFFER }
fn default_max_retries() -> u32 { 3 }
fn default_check_constraints() -> bool { true }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a file, with environment overrides on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.engine.max_retries, 3);
        assert!(config.engine.check_constraints);
        assert!(config.engine.snapshot_interval.is_none());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[store]
backend = "sqlite"
url = "sqlite://petri.db"
acquire_timeout = "5s"

[engine]
snapshot_interval = 50
check_constraints = false
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.url, "sqlite://petri.db");
        assert_eq!(config.store.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.store.max_connections, 5);
        assert_eq!(config.engine.snapshot_interval, Some(50));
        assert!(!config.engine.check_constraints);
    }

    #[tokio::test]
    async fn test_open_memory_store() {
        let store = open_store(&StoreConfig::default()).await.unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[tokio::test]
    async fn test_open_sqlite_store() {
        let config = StoreConfig {
            backend: StoreBackend::Sqlite,
            ..StoreConfig::default()
        };
        let store = config.open().await.unwrap();
        assert_eq!(store.name(), "sqlite");
        store.close().await.unwrap();
    }
}
