//! Error types for the morphcache core

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the caching and resilience core
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("Failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Redis command or connection error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// An operation exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    // =========================================================================
    // Resilience Errors
    // =========================================================================
    /// Call rejected because the circuit is open
    #[error("Circuit '{name}' is open; call rejected")]
    CircuitOpen { name: String },

    /// Upstream producer (fetch + transform) failed
    #[error("Producer failed: {0}")]
    Producer(String),

    /// One producer failure observed by every coalesced waiter
    #[error(transparent)]
    Shared(Arc<Error>),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Scanning the storage directory failed
    #[error("Storage scan of {path} failed: {source}")]
    StorageScan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Eviction policy name is not recognised
    #[error("Unknown eviction policy '{0}' (expected lru, size-based or intelligent)")]
    UnknownEvictionPolicy(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Follow shared wrappers down to the error that actually occurred
    pub fn root(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// True when the call never ran because a circuit was open
    pub fn is_circuit_open(&self) -> bool {
        matches!(self.root(), Error::CircuitOpen { .. })
    }

    /// True for producer failures, including timeouts of the producer call
    pub fn is_producer_failure(&self) -> bool {
        matches!(self.root(), Error::Producer(_) | Error::Timeout { .. })
    }
}

impl From<Arc<Error>> for Error {
    fn from(err: Arc<Error>) -> Self {
        Error::Shared(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_error_is_transparent() {
        let inner = Arc::new(Error::Producer("upstream returned 502".to_string()));
        let err = Error::from(inner);
        assert_eq!(err.to_string(), "Producer failed: upstream returned 502");
        assert!(err.is_producer_failure());
        assert!(!err.is_circuit_open());
    }

    #[test]
    fn test_circuit_open_is_distinct_from_producer_failure() {
        let err = Error::CircuitOpen {
            name: "upstream".to_string(),
        };
        assert!(err.is_circuit_open());
        assert!(!err.is_producer_failure());
    }

    #[test]
    fn test_unknown_policy_message_names_policy() {
        let err = Error::UnknownEvictionPolicy("fifo".to_string());
        assert!(err.to_string().contains("'fifo'"));
    }
}
