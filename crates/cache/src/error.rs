//! Error types for the cache engine

use crate::types::CacheKind;
use std::io;

/// Errors surfaced by registry operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The operation referenced a kind with no live registration
    #[error("no cache registered for {0}")]
    NotRegistered(CacheKind),

    /// A live cache already occupies the slot (register-if-absent only)
    #[error("a cache is already registered for {0}")]
    AlreadyRegistered(CacheKind),

    /// The cache handed to the registry is no longer alive
    #[error("cache for {0} is not a valid live instance")]
    InvalidCache(CacheKind),

    /// Thresholds out of range or inverted
    #[error("invalid pressure thresholds: warning {warning}, critical {critical}")]
    InvalidThreshold { warning: f64, critical: f64 },

    /// A cache failed to evict; the sweep moved on to the other caches
    #[error("eviction failed for {kind}: {source}")]
    EvictionFailed {
        kind: CacheKind,
        #[source]
        source: EntryError,
    },

    /// A cache panicked inside a contract call
    #[error("cache operation panicked for {0}")]
    CacheOperationPanicked(CacheKind),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure reported by a cache implementation from a contract call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    /// The cache cannot service the call right now
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

/// Errors that can occur while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A key carried a value that could not be parsed
    #[error("invalid value for configuration key {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    /// Reading the configuration file failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The JSON form of the configuration could not be parsed
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, value: &str) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
