//! Error taxonomy for the cache core
//!
//! Cache-tier failures (`Transport`, `LockTimeout`) are recoverable: read paths
//! degrade to a miss and log. Source and refresh failures are business
//! significant and always reach the caller.
//!
//! A confirmed "not found" from the authoritative source is not an error; it is
//! reported as `Ok(None)` and results in a nil flag.

use std::time::Duration;

/// Boxed error used at capability boundaries (stores, transports, sources)
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used across the crate
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors produced by the cache core
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Shared store or lock service unreachable or timed out
    #[error("shared store transport failure during {op} on '{key}': {source}")]
    Transport {
        op: &'static str,
        key: String,
        #[source]
        source: BoxError,
    },

    /// Value could not be encoded for, or decoded from, the shared store
    #[error("serialization failed for '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Lock not acquired within the budget. Read paths treat this as a
    /// control-flow signal and never return it; write paths surface it.
    #[error("lock on '{key}' not acquired within {timeout:?}")]
    LockTimeout { key: String, timeout: Duration },

    /// Authoritative source failed; nothing is cached
    #[error("authoritative source failed for '{key}': {source}")]
    SourceTransport {
        key: String,
        #[source]
        source: BoxError,
    },

    /// Refresh left residue behind (value or nil flag still present)
    #[error(
        "refresh of '{key}' left residue (value cleared: {value_cleared}, nil flag cleared: {nil_flag_cleared})"
    )]
    RefreshInconsistency {
        key: String,
        value_cleared: bool,
        nil_flag_cleared: bool,
    },

    /// Invalidation bus could not publish or subscribe
    #[error("invalidation bus failure on channel '{channel}': {source}")]
    Bus {
        channel: String,
        #[source]
        source: BoxError,
    },

    /// Invalid configuration or missing backend
    #[error("configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// Build a transport error from any backend error
    pub fn transport(op: &'static str, key: &str, source: impl Into<BoxError>) -> Self {
        Self::Transport {
            op,
            key: key.to_string(),
            source: source.into(),
        }
    }

    /// Build a bus error from any transport error
    pub fn bus(channel: &str, source: impl Into<BoxError>) -> Self {
        Self::Bus {
            channel: channel.to_string(),
            source: source.into(),
        }
    }

    /// Whether the caller may degrade gracefully instead of failing the request
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::LockTimeout { .. } | Self::Bus { .. }
        )
    }
}
