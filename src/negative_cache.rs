//! Negative Cache Guard - Nil Flags
//!
//! Records "looked up and confirmed absent" so repeated lookups of missing keys
//! stop reaching the authoritative source (cache penetration).
//!
//! The flag is a reserved sentinel stored at the value's own shared key:
//! - writing a real value overwrites the flag
//! - a flag is only written into a vacant key, so it never masks a value
//! - clearing the flag is a compare-and-delete, so it never removes a value

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::NilFlagConfig;
use crate::error::CacheResult;
use crate::shared_cache::{NIL_FLAG, SharedCache};

/// Nil-flag operations in the shared cache namespace
pub struct NegativeCacheGuard {
    shared: Arc<SharedCache>,
    ttl: Duration,
}

impl NegativeCacheGuard {
    /// Create a guard writing flags with the configured TTL
    pub fn new(shared: Arc<SharedCache>, config: NilFlagConfig) -> Self {
        Self {
            shared,
            ttl: config.ttl,
        }
    }

    /// Lifetime of newly written flags
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether `key` is flagged as confirmed absent
    pub async fn has_nil_flag(&self, key: &str) -> CacheResult<bool> {
        Ok(self
            .shared
            .get_raw(key)
            .await?
            .is_some_and(|bytes| bytes == NIL_FLAG))
    }

    /// Flag `key` as confirmed absent
    ///
    /// Returns `false` when the key already holds something (a real value
    /// written concurrently, or a live flag), in which case nothing changes.
    pub async fn put_nil_flag(&self, key: &str) -> CacheResult<bool> {
        let written = self
            .shared
            .store()
            .set_if_absent(&self.shared.namespaced(key), NIL_FLAG, self.ttl)
            .await?;
        debug!(key = %key, written, ttl_secs = self.ttl.as_secs(), "[NilFlag] Put nil flag");
        Ok(written)
    }

    /// Clear the flag on `key`; `true` if a flag was removed
    pub async fn del_nil_flag(&self, key: &str) -> CacheResult<bool> {
        let removed = self
            .shared
            .store()
            .delete_if_eq(&self.shared.namespaced(key), NIL_FLAG)
            .await?;
        debug!(key = %key, removed, "[NilFlag] Cleared nil flag");
        Ok(removed)
    }
}
