//! Configuration management for CLI, environment variables, and config files.

use crate::counter::PopulatePolicy;
use crate::error::{CounterError, CounterResult, ValidationIssue};
use crate::store::TtlPolicy;
use crate::types::KeySpace;
use redis::IntoConnectionInfo;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use strum::{Display, EnumString};

/// Main configuration for like-counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub flusher: FlusherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which fast store implementation backs the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StoreBackend {
    Memory,
    Redis,
}

/// Configuration for the fast counter store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    pub key_prefix: String,
    /// Capacity of the in-process backend
    pub max_entries: u64,
}

/// Configuration for counter caching and populate locking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub ttl_jitter_secs: u64,
    pub lock_ttl_ms: u64,
    pub lock_backoff_ms: u64,
    pub fallback_without_lock: bool,
}

/// Configuration for the write-back flusher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlusherConfig {
    pub batch: usize,
    pub interval_ms: u64,
    pub shutdown_timeout_secs: u64,
}

/// Configuration for logging output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub metrics_enabled: bool,
    pub metrics_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: KeySpace::default().prefix().to_string(),
            max_entries: 100_000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            ttl_jitter_secs: 60,
            lock_ttl_ms: 3000,
            lock_backoff_ms: 50,
            fallback_without_lock: true,
        }
    }
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            batch: 200,
            interval_ms: 1000,
            shutdown_timeout_secs: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            metrics_enabled: true,
            metrics_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy::new(
            Duration::from_secs(self.ttl_secs),
            Duration::from_secs(self.ttl_jitter_secs),
        )
    }

    pub fn populate_policy(&self) -> PopulatePolicy {
        PopulatePolicy {
            lock_ttl: Duration::from_millis(self.lock_ttl_ms),
            lock_backoff: Duration::from_millis(self.lock_backoff_ms),
            fallback_without_lock: self.fallback_without_lock,
        }
    }
}

impl FlusherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn env_var<T: FromStr>(name: &str) -> CounterResult<Option<T>> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CounterError::InvalidArgument(format!("{} has invalid format", name))),
        Err(_) => Ok(None),
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &PathBuf) -> CounterResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CounterError::IoError(format!("{}: {}", path.display(), e)))?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());
        match ext.as_deref() {
            Some("json") => Ok(serde_json::from_str(&content)?),
            _ => Ok(toml::from_str(&content)?),
        }
    }

    pub fn from_default_locations() -> CounterResult<Self> {
        let config_dirs = [
            dirs::config_dir().map(|d| d.join("like-counter/config.toml")),
            Some(PathBuf::from("/etc/like-counter/config.toml")),
            Some(PathBuf::from("./like-counter.toml")),
        ];

        for path in config_dirs.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    pub fn merge_from_env(mut self) -> CounterResult<Self> {
        if let Some(val) = env_var("LIKE_COUNTER_BACKEND")? {
            self.store.backend = val;
        }
        if let Ok(val) = std::env::var("LIKE_COUNTER_REDIS_URL") {
            self.store.redis_url = val;
        }
        if let Ok(val) = std::env::var("LIKE_COUNTER_KEY_PREFIX") {
            self.store.key_prefix = val;
        }
        if let Some(val) = env_var("LIKE_COUNTER_MAX_ENTRIES")? {
            self.store.max_entries = val;
        }

        if let Some(val) = env_var("LIKE_COUNTER_TTL_SECS")? {
            self.cache.ttl_secs = val;
        }
        if let Some(val) = env_var("LIKE_COUNTER_TTL_JITTER_SECS")? {
            self.cache.ttl_jitter_secs = val;
        }
        if let Some(val) = env_var("LIKE_COUNTER_LOCK_TTL_MS")? {
            self.cache.lock_ttl_ms = val;
        }
        if let Some(val) = env_var("LIKE_COUNTER_LOCK_BACKOFF_MS")? {
            self.cache.lock_backoff_ms = val;
        }
        if let Some(val) = env_var("LIKE_COUNTER_FALLBACK_WITHOUT_LOCK")? {
            self.cache.fallback_without_lock = val;
        }

        if let Some(val) = env_var("LIKE_COUNTER_FLUSH_BATCH")? {
            self.flusher.batch = val;
        }
        if let Some(val) = env_var("LIKE_COUNTER_FLUSH_INTERVAL_MS")? {
            self.flusher.interval_ms = val;
        }
        if let Some(val) = env_var("LIKE_COUNTER_SHUTDOWN_TIMEOUT_SECS")? {
            self.flusher.shutdown_timeout_secs = val;
        }

        if let Ok(val) = std::env::var("LIKE_COUNTER_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = env_var("LIKE_COUNTER_METRICS_ENABLED")? {
            self.logging.metrics_enabled = val;
        }

        Ok(self)
    }

    pub fn merge_from_cli(mut self, cli: &CliArgs) -> Self {
        if let Some(backend) = cli.backend {
            self.store.backend = backend;
        }

        if let Some(ref url) = cli.redis_url {
            self.store.redis_url = url.clone();
        }

        if let Some(ref level) = cli.log_level {
            self.logging.level = level.clone();
        }

        self
    }

    pub fn load() -> CounterResult<Self> {
        Self::from_default_locations()?.merge_from_env()
    }

    /// An explicit `--config` file replaces the default locations.
    pub fn load_with_cli(cli: &CliArgs) -> CounterResult<Self> {
        let base = match cli.config_file {
            Some(ref path) => Self::from_file(path)?,
            None => Self::from_default_locations()?,
        };
        Ok(base.merge_from_env()?.merge_from_cli(cli))
    }

    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(self.store.key_prefix.clone())
    }

    pub fn validate(&self) -> CounterResult<()> {
        let mut issues = Vec::new();

        if self.store.backend == StoreBackend::Redis {
            if let Err(e) = self.store.redis_url.as_str().into_connection_info() {
                issues.push(ValidationIssue {
                    field: "store.redis_url".to_string(),
                    message: format!("Invalid redis URL: {}", e),
                });
            }
        }

        if self.store.key_prefix.is_empty() {
            issues.push(ValidationIssue {
                field: "store.key_prefix".to_string(),
                message: "Key prefix cannot be empty".to_string(),
            });
        }

        if self.store.max_entries == 0 {
            issues.push(ValidationIssue {
                field: "store.max_entries".to_string(),
                message: "Capacity must be greater than zero".to_string(),
            });
        }

        if self.cache.ttl_secs == 0 {
            issues.push(ValidationIssue {
                field: "cache.ttl_secs".to_string(),
                message: "TTL must be greater than zero".to_string(),
            });
        } else if self.cache.ttl_jitter_secs >= self.cache.ttl_secs {
            issues.push(ValidationIssue {
                field: "cache.ttl_jitter_secs".to_string(),
                message: format!(
                    "Jitter ({}s) must be smaller than the TTL ({}s)",
                    self.cache.ttl_jitter_secs, self.cache.ttl_secs
                ),
            });
        }

        if !(1..=60_000).contains(&self.cache.lock_ttl_ms) {
            issues.push(ValidationIssue {
                field: "cache.lock_ttl_ms".to_string(),
                message: "Lock TTL must be between 1ms and 60s".to_string(),
            });
        } else if self.cache.lock_backoff_ms >= self.cache.lock_ttl_ms {
            issues.push(ValidationIssue {
                field: "cache.lock_backoff_ms".to_string(),
                message: "Lock backoff must be shorter than the lock TTL".to_string(),
            });
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            issues.push(ValidationIssue {
                field: "logging.level".to_string(),
                message: format!(
                    "Invalid log level '{}'. Valid levels: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            });
        }

        if self.logging.metrics_enabled && self.logging.metrics_interval_secs == 0 {
            issues.push(ValidationIssue {
                field: "logging.metrics_interval_secs".to_string(),
                message: "Metrics interval must be greater than zero".to_string(),
            });
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(CounterError::ValidationError(issues))
        }
    }
}

/// Command-line arguments that override configuration values.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config_file: Option<PathBuf>,
    pub backend: Option<StoreBackend>,
    pub redis_url: Option<String>,
    pub log_level: Option<String>,
}
