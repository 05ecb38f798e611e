//! Mobilib Core - Shared Types
//!
//! Errors, configuration, time source and telemetry setup shared by the
//! cache crates. No caching logic lives here.

pub mod clock;
pub mod config;
pub mod error;
pub mod telemetry;

pub use clock::{from_millis, to_chrono, to_millis, Clock, ManualClock, SystemClock, Timestamp};
pub use config::{
    validate_namespace, CacheConfig, IndexConfig, MobilibConfig, DEFAULT_BATCH_INTERVAL_MS,
    DEFAULT_CACHE_DURATION_MS, DEFAULT_INDEX_MAX_SIZE_MB, MAX_INDEX_SIZE_MB, NAMESPACE_SEPARATOR,
};
pub use error::{CacheError, CacheResult, ConfigError, IndexError, SourceError};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, DEFAULT_LOG_FILTER};
