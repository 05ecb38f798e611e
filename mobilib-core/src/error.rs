//! Error types for Mobilib cache operations

use thiserror::Error;

/// Existence-index errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("Failed to open existence index: {reason}")]
    Open { reason: String },

    #[error("Transaction failed: {reason}")]
    Transaction { reason: String },

    #[error("Corrupted index record for key {key}: {reason}")]
    Corrupted { key: String, reason: String },

    #[error("Index worker failed: {reason}")]
    TaskJoin { reason: String },

    #[error("Index lock poisoned")]
    LockPoisoned,
}

/// Errors reported by caller-supplied data sources.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Server fetch failed: {reason}")]
    Server { reason: String },

    #[error("Database access failed: {reason}")]
    Database { reason: String },
}

impl SourceError {
    /// Shorthand for a server failure.
    pub fn server(reason: impl Into<String>) -> Self {
        Self::Server {
            reason: reason.into(),
        }
    }

    /// Shorthand for a database failure.
    pub fn database(reason: impl Into<String>) -> Self {
        Self::Database {
            reason: reason.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file: {reason}")]
    Io { reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Failed to initialize telemetry: {reason}")]
    Telemetry { reason: String },
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            reason: e.to_string(),
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Parse {
            reason: e.to_string(),
        }
    }
}

/// Master error type for all cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// No tier could resolve every requested id.
    #[error("Incomplete result, {} id(s) unresolved: {:?}", .missing.len(), .missing)]
    Incomplete { missing: Vec<String> },

    #[error("Object not found: {id}")]
    NotFound { id: String },

    /// The request was cancelled before it started executing.
    #[error("Request cancelled before it started")]
    Cancelled,

    #[error("Cache runtime shut down before the request completed")]
    Shutdown,
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
