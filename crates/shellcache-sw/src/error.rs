//! Errors raised by the cache layer.

use thiserror::Error;

/// Errors that can occur in cache storage and lifecycle operations.
///
/// Network failures are not listed here: the strategies recover from them or
/// hand them back to the page as `NetError`.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Quota exceeded: need {needed} bytes, quota is {quota} bytes")]
    QuotaExceeded { needed: u64, quota: u64 },

    #[error("Cache not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("State error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Get the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            CacheError::Storage(_) => "storage",
            CacheError::QuotaExceeded { .. } => "quota",
            CacheError::NotFound(_) => "not_found",
            CacheError::Config(_) => "config",
            CacheError::Serialization(_) => "serialization",
            CacheError::State(_) => "state",
            CacheError::Io(_) => "io",
        }
    }
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
