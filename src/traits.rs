//! Capability Traits
//!
//! The core is agnostic to the concrete distributed store, lock service and
//! message transport. These traits are the seams: the default implementations
//! live in [`crate::backends`], and test doubles implement the same
//! timeout and false-on-contention semantics.
//!
//! - `SharedStore`: raw byte store shared by every node (values, nil flags, locks)
//! - `DistributedLock`: cluster-wide mutual exclusion keyed by cache key
//! - `BusTransport`: publish/subscribe carrier for invalidation messages
//!
//! # Example: Custom Store
//!
//! ```rust,ignore
//! use coherent_cache::{SharedStore, CacheResult, async_trait};
//! use std::time::Duration;
//!
//! struct MyStore;
//!
//! #[async_trait]
//! impl SharedStore for MyStore {
//!     async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
//!         // Your implementation
//!     }
//!     // ... remaining operations
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::CacheResult;
use crate::lock::LockHandle;

/// Network-accessible byte store shared by all nodes
///
/// Keys passed in are already fully namespaced. Every operation may fail with
/// `CacheError::Transport`, which callers must read as "unknown", never as
/// "absent".
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Get raw bytes stored at `key`; expired entries are `None`
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store `value` at `key`, replacing whatever was there
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    /// Store `value` only if `key` is vacant
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - value written
    /// * `Ok(false)` - key already held a live value
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool>;

    /// Remove `key` only if it currently holds exactly `expected`
    ///
    /// This is the compare-and-delete primitive used for lock release and for
    /// clearing a nil flag without touching a real value (and vice versa).
    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> CacheResult<bool>;

    /// Verify the store is reachable
    async fn health_check(&self) -> bool;

    /// Name used in logs
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Cluster-wide mutual exclusion keyed by cache key
///
/// Not reentrant: a second `lock()` on a key this node already holds waits like
/// any other contender. Every successful `lock()` must be paired with exactly
/// one `unlock()`; prefer [`crate::lock::LockGuard`] for scoped acquisition.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to acquire the lock for `key`, waiting at most `timeout`
    ///
    /// # Returns
    ///
    /// * `Ok(Some(handle))` - acquired
    /// * `Ok(None)` - not acquired within `timeout` (contention)
    /// * `Err(e)` - lock service unreachable
    async fn lock(&self, key: &str, timeout: Duration) -> CacheResult<Option<LockHandle>>;

    /// Release a lock previously acquired with `lock()`
    ///
    /// Returns `false` if the lease had already expired (or was taken over).
    async fn unlock(&self, handle: &LockHandle) -> CacheResult<bool>;
}

/// Publish/subscribe carrier for serialized invalidation messages
///
/// Delivery is at-most-once and best effort. A subscriber receives messages
/// published by its own node as well as by peers.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Publish a payload on `channel`
    async fn publish(&self, channel: &str, payload: String) -> CacheResult<()>;

    /// Open a subscription on `channel`
    ///
    /// The stream ends when the underlying connection is lost; the caller is
    /// expected to resubscribe.
    async fn subscribe(&self, channel: &str) -> CacheResult<BoxStream<'static, String>>;

    /// Name used in logs
    fn name(&self) -> &'static str {
        "unknown"
    }
}
