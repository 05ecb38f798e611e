//! Configuration types

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default expiration window: one hour.
pub const DEFAULT_CACHE_DURATION_MS: u64 = 60 * 60 * 1000;

/// Default batching tick of the pending cache master.
pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 100;

/// Default LMDB map size for the existence index.
pub const DEFAULT_INDEX_MAX_SIZE_MB: usize = 64;

/// Upper bound for the LMDB map size (1 TiB).
pub const MAX_INDEX_SIZE_MB: usize = 1024 * 1024;

/// Separator between a namespace and an origin id in index keys.
pub const NAMESPACE_SEPARATOR: char = '#';

/// Check that `namespace` can prefix index keys.
///
/// A namespace containing the separator would make its prefix a prefix of
/// another namespace's keys (`user#` covers every `user#vip#..` key).
pub fn validate_namespace(namespace: &str) -> Result<(), ConfigError> {
    let reason = if namespace.trim().is_empty() {
        "must not be blank".to_string()
    } else if namespace.contains(NAMESPACE_SEPARATOR) {
        format!("must not contain '{NAMESPACE_SEPARATOR}'")
    } else {
        return Ok(());
    };
    Err(ConfigError::InvalidValue {
        field: "namespace".to_string(),
        value: namespace.to_string(),
        reason,
    })
}

/// Per-cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Expiration window shared by the memory map and the existence index.
    /// Zero means entries never expire.
    #[serde(rename = "duration_ms", with = "duration_millis")]
    pub duration: Duration,

    /// Serve possibly stale rows from the caller's database when the
    /// server fetch fails.
    pub fallback_on_server_fail: bool,

    /// How long the pending cache master accumulates requests.
    #[serde(rename = "batch_interval_ms", with = "duration_millis")]
    pub batch_interval: Duration,

    /// Explicit combo-id namespace. When absent the cached type's name is used.
    #[serde(default)]
    pub namespace: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(DEFAULT_CACHE_DURATION_MS),
            fallback_on_server_fail: false,
            batch_interval: Duration::from_millis(DEFAULT_BATCH_INTERVAL_MS),
            namespace: None,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the expiration window.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Enable or disable the stale-database fallback.
    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_on_server_fail = enabled;
        self
    }

    /// Set the batching tick.
    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }

    /// Pin the combo-id namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "batch_interval".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        match &self.namespace {
            Some(ns) => validate_namespace(ns),
            None => Ok(()),
        }
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `MOBILIB_CACHE_DURATION_MS`: Expiration window (default: 3600000)
    /// - `MOBILIB_CACHE_FALLBACK`: Database fallback on server failure (default: false)
    /// - `MOBILIB_CACHE_BATCH_INTERVAL_MS`: Batching tick (default: 100)
    /// - `MOBILIB_CACHE_NAMESPACE`: Combo-id namespace (default: type name)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            duration: std::env::var("MOBILIB_CACHE_DURATION_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.duration),
            fallback_on_server_fail: std::env::var("MOBILIB_CACHE_FALLBACK")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.fallback_on_server_fail),
            batch_interval: std::env::var("MOBILIB_CACHE_BATCH_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_interval),
            namespace: std::env::var("MOBILIB_CACHE_NAMESPACE").ok(),
        }
    }
}

/// Location and size of the persistent existence index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    pub path: PathBuf,
    pub max_size_mb: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mobilib-index"),
            max_size_mb: DEFAULT_INDEX_MAX_SIZE_MB,
        }
    }
}

impl IndexConfig {
    /// Environment variables:
    /// - `MOBILIB_INDEX_PATH`: LMDB directory (default: ./mobilib-index)
    /// - `MOBILIB_INDEX_MAX_SIZE_MB`: LMDB map size (default: 64)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            path: std::env::var("MOBILIB_INDEX_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.path),
            max_size_mb: std::env::var("MOBILIB_INDEX_MAX_SIZE_MB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_size_mb),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "index.path".to_string(),
                value: String::new(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.max_size_mb == 0 || self.max_size_mb > MAX_INDEX_SIZE_MB {
            return Err(ConfigError::InvalidValue {
                field: "index.max_size_mb".to_string(),
                value: self.max_size_mb.to_string(),
                reason: format!("must be in 1..={MAX_INDEX_SIZE_MB}"),
            });
        }
        Ok(())
    }
}

/// File-level configuration: one cache section and one index section.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MobilibConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub index: IndexConfig,
}

impl MobilibConfig {
    /// Load and validate a TOML configuration file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: MobilibConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.index.validate()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// =============================================================================
// TESTS
// =============================================================================
