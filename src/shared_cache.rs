//! Shared Cache - Distributed Tier
//!
//! Typed view over a [`SharedStore`]. Values are JSON-encoded on write and
//! decoded into the caller's type on read, and every key is stored under the
//! application-wide prefix (`<prefix>:<key>`).
//!
//! The nil flag of [`crate::negative_cache`] lives at the value's own key as a
//! reserved byte string, so a key holds either a value or a flag, never both.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::SharedCacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::traits::SharedStore;

/// Sentinel stored in place of a value for a confirmed-absent key.
/// A leading NUL byte can never start a JSON document.
pub(crate) const NIL_FLAG: &[u8] = b"\0nil";

/// Typed, namespaced access to the shared store
pub struct SharedCache {
    store: Arc<dyn SharedStore>,
    key_prefix: String,
    default_ttl: Duration,
}

impl SharedCache {
    /// Create a shared cache over `store`
    pub fn new(store: Arc<dyn SharedStore>, config: &SharedCacheConfig) -> Self {
        Self {
            store,
            key_prefix: config.key_prefix.clone(),
            default_ttl: config.default_ttl,
        }
    }

    /// Full store key for a cache key
    #[must_use]
    pub fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    /// TTL of positive entries
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub(crate) fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub(crate) fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Raw bytes at a cache key (value or nil flag)
    pub(crate) async fn get_raw(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.store.get(&self.namespaced(key)).await
    }

    /// Get a live value decoded as `T`
    ///
    /// # Returns
    ///
    /// * `Ok(Some(value))` - a real value is cached
    /// * `Ok(None)` - nothing cached, or only a nil flag
    /// * `Err(Transport)` - store unreachable; the key state is unknown
    /// * `Err(Serialization)` - cached bytes do not decode as `T`
    pub async fn get_timed<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.get_raw(key).await? {
            Some(bytes) if bytes != NIL_FLAG => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| CacheError::Serialization {
                    key: key.to_string(),
                    source,
                }),
            _ => Ok(None),
        }
    }

    /// Store a value with the default TTL, replacing any nil flag
    pub async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> CacheResult<()> {
        self.put_with_ttl(key, value, self.default_ttl).await
    }

    /// Store a value with an explicit TTL, replacing any nil flag
    pub async fn put_with_ttl<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> CacheResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|source| CacheError::Serialization {
            key: key.to_string(),
            source,
        })?;
        self.store.set(&self.namespaced(key), &bytes, ttl).await?;
        debug!(key = %key, ttl_secs = ttl.as_secs(), "[Shared] Cached key");
        Ok(())
    }

    /// Delete a real value
    ///
    /// A nil flag at the key is left untouched. Returns `true` only if a real
    /// value was removed.
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        let Some(current) = self.get_raw(key).await? else {
            return Ok(false);
        };
        if current == NIL_FLAG {
            return Ok(false);
        }
        let removed = self
            .store
            .delete_if_eq(&self.namespaced(key), &current)
            .await?;
        if !removed {
            warn!(key = %key, "[Shared] Value changed concurrently, delete skipped");
        }
        Ok(removed)
    }

    /// Whether a real value is cached (a nil flag does not count)
    pub async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self
            .get_raw(key)
            .await?
            .is_some_and(|bytes| bytes != NIL_FLAG))
    }

    /// Verify the underlying store is reachable
    pub async fn health_check(&self) -> bool {
        self.store.health_check().await
    }
}
