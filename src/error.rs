//! Error types
//!
//! Backend operations return `anyhow::Result` and degrade infrastructure failures
//! to misses. `CacheError` covers the failures that are surfaced to callers:
//! bad configuration and malformed input.

use thiserror::Error;

/// Errors surfaced by construction and validation
#[derive(Error, Debug)]
pub enum CacheError {
    /// Namespace was empty or whitespace only
    #[error("Invalid namespace: {0:?}")]
    InvalidNamespace(String),

    /// A configuration value is out of range or unparsable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A glob pattern passed to `scan_keys` could not be compiled
    #[error("Invalid key pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// Value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for fallible construction
pub type CacheResult<T> = std::result::Result<T, CacheError>;
