//! Cache Manager - Coherent Two-Tier Operations
//!
//! Runs the read and write protocols across the local tier, the shared tier,
//! nil flags, the distributed lock and the invalidation bus.
//!
//! Read (`get_or_load`):
//!
//! ```text
//! local hit ──────────────────────────────────────────────► value
//! shared hit ─► promote to local ─────────────────────────► value
//! nil flag ───────────────────────────────────────────────► absent
//! lock ─► double-check shared/flag ─► source ─► shared + UPDATE, or nil flag
//! ```
//!
//! Shared tier outages degrade the read to a direct source call that caches
//! nothing. Writes (`put`, `delete`, `refresh`) change the shared tier first and
//! then publish; no write path touches the local tier directly.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{BoxError, CacheError, CacheResult};
use crate::invalidation::{ChannelType, InvalidationBus, InvalidationMessage};
use crate::local_cache::LocalCache;
use crate::lock::LockGuard;
use crate::negative_cache::NegativeCacheGuard;
use crate::shared_cache::SharedCache;
use crate::traits::DistributedLock;

/// RAII cleanup guard for in-flight request tracking
/// Removes the entry on early return or panic once no other caller holds it
struct CleanupGuard<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        // The map's handle plus the owner's; any more are queued waiters
        self.map
            .remove_if(&self.key, |_, entry| Arc::strong_count(entry) <= 2);
    }
}

/// Outcome of one clear in a refresh
enum ClearStep {
    /// Deleted (`true`) or failed with a transport error (`false`)
    Done(bool),
    /// Nothing matched; it may have been cleared by someone else
    Vanished,
}

/// Outcome of a shared-tier lookup on the read path
enum SharedRead<T> {
    Hit(T),
    Miss,
    Degraded,
}

/// Cache Manager - unified operations across both tiers
pub struct CacheManager {
    local: Arc<LocalCache>,
    shared: Arc<SharedCache>,
    nil_guard: Arc<NegativeCacheGuard>,
    lock: Arc<dyn DistributedLock>,
    bus: Arc<InvalidationBus>,
    lock_timeout: Duration,
    /// Statistics
    total_requests: AtomicU64,
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    nil_flag_hits: AtomicU64,
    source_loads: AtomicU64,
    lock_timeouts: AtomicU64,
    degraded_reads: AtomicU64,
    /// Same-node callers of one key queue on a shared mutex; the entry lives
    /// until the last of them leaves
    in_flight_requests: DashMap<String, Arc<Mutex<()>>>,
}

impl CacheManager {
    /// Create new cache manager
    ///
    /// # Arguments
    ///
    /// * `lock_timeout` - how long a read or write waits for the per-key lock
    pub fn new(
        local: Arc<LocalCache>,
        shared: Arc<SharedCache>,
        nil_guard: Arc<NegativeCacheGuard>,
        lock: Arc<dyn DistributedLock>,
        bus: Arc<InvalidationBus>,
        lock_timeout: Duration,
    ) -> Self {
        info!(lock_timeout_ms = lock_timeout.as_millis(), "Initializing Cache Manager");
        Self {
            local,
            shared,
            nil_guard,
            lock,
            bus,
            lock_timeout,
            total_requests: AtomicU64::new(0),
            local_hits: AtomicU64::new(0),
            shared_hits: AtomicU64::new(0),
            nil_flag_hits: AtomicU64::new(0),
            source_loads: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),
            degraded_reads: AtomicU64::new(0),
            in_flight_requests: DashMap::new(),
        }
    }

    /// Local tier key for a cache key
    #[must_use]
    pub fn local_key(key: &str) -> String {
        ChannelType::HotData.local_key(key)
    }

    /// Look a key up in the cache tiers only; the source is never called
    ///
    /// A shared hit is promoted to the local tier. A nil flag reads as absent.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Transport` if the shared tier is unreachable, so the
    /// caller can tell an outage from a genuine miss.
    pub async fn get<T>(&self, key: &str) -> CacheResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let local_key = Self::local_key(key);

        if let Some(value) = self.local_typed::<T>(&local_key).await {
            self.local_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }

        let Some(value) = self.shared.get_timed::<serde_json::Value>(key).await? else {
            return Ok(None);
        };
        let typed = serde_json::from_value::<T>(value.clone()).map_err(|source| {
            CacheError::Serialization {
                key: key.to_string(),
                source,
            }
        })?;
        self.shared_hits.fetch_add(1, Ordering::Relaxed);
        self.promote(&local_key, value).await;
        Ok(Some(typed))
    }

    /// Read-through lookup with cluster-wide single-flight recompute
    ///
    /// # Arguments
    ///
    /// * `key` - Cache key, e.g. `org:userId:42`
    /// * `loader` - Authoritative lookup: `Ok(Some)` found, `Ok(None)` confirmed
    ///   absent, `Err` transport or auth failure
    ///
    /// # Returns
    ///
    /// * `Ok(Some(value))` - from a cache tier or freshly loaded
    /// * `Ok(None)` - absent: nil flag set, source said not found, or the lock
    ///   could not be acquired in time
    ///
    /// # Errors
    ///
    /// Returns `CacheError::SourceTransport` if the loader fails; nothing is
    /// cached in that case.
    pub async fn get_or_load<T, F, Fut>(&self, key: &str, loader: F) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>, BoxError>> + Send,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let local_key = Self::local_key(key);

        // Fast path: local tier, no coordination
        if let Some(value) = self.local_typed::<T>(&local_key).await {
            self.local_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }

        let in_flight = self
            .in_flight_requests
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _cleanup_guard = CleanupGuard {
            map: &self.in_flight_requests,
            key: key.to_string(),
        };
        let _in_flight_guard = in_flight.lock().await;

        // A same-node caller may have promoted the value while we queued
        if let Some(value) = self.local_typed::<T>(&local_key).await {
            self.local_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }

        match self.read_shared::<T>(key).await {
            SharedRead::Hit((typed, raw)) => {
                self.shared_hits.fetch_add(1, Ordering::Relaxed);
                self.promote(&local_key, raw).await;
                return Ok(Some(typed));
            }
            SharedRead::Degraded => return self.load_degraded(key, loader).await,
            SharedRead::Miss => {}
        }

        match self.nil_guard.has_nil_flag(key).await {
            Ok(true) => {
                self.nil_flag_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "[NilFlag] Key flagged as absent");
                return Ok(None);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Nil flag check failed, degrading to source");
                return self.load_degraded(key, loader).await;
            }
        }

        let guard = match LockGuard::acquire(Arc::clone(&self.lock), key, self.lock_timeout).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %key,
                    timeout_ms = self.lock_timeout.as_millis(),
                    "[Lock] Timed out, reporting absent"
                );
                return Ok(None);
            }
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    "[Lock] Lock service unavailable, degrading to source"
                );
                return self.load_degraded(key, loader).await;
            }
        };

        let result = self.load_locked(key, &local_key, loader).await;
        guard.release().await;
        result
    }

    /// Body of the read path while the per-key lock is held
    async fn load_locked<T, F, Fut>(
        &self,
        key: &str,
        local_key: &str,
        loader: F,
    ) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>, BoxError>> + Send,
    {
        // Double-check: the previous holder may have filled or flagged the key
        match self.read_shared::<T>(key).await {
            SharedRead::Hit((typed, raw)) => {
                self.shared_hits.fetch_add(1, Ordering::Relaxed);
                self.promote(local_key, raw).await;
                return Ok(Some(typed));
            }
            SharedRead::Degraded => return self.load_degraded(key, loader).await,
            SharedRead::Miss => {}
        }
        match self.nil_guard.has_nil_flag(key).await {
            Ok(true) => {
                self.nil_flag_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Nil flag re-check failed, degrading to source");
                return self.load_degraded(key, loader).await;
            }
        }

        self.source_loads.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Loading from source (single-flight)");
        let loaded = loader().await.map_err(|source| CacheError::SourceTransport {
            key: key.to_string(),
            source,
        })?;

        match loaded {
            Some(value) => {
                let raw = serde_json::to_value(&value).map_err(|source| {
                    CacheError::Serialization {
                        key: key.to_string(),
                        source,
                    }
                })?;
                if let Err(e) = self.shared.put(key, &raw).await {
                    warn!(key = %key, error = %e, "Failed to populate shared tier after load");
                    return Ok(Some(value));
                }
                let message = InvalidationMessage::update(
                    ChannelType::HotData,
                    key,
                    raw,
                    Some(self.shared.default_ttl()),
                );
                if let Err(e) = self.bus.publish(&message).await {
                    warn!(key = %key, error = %e, "Failed to publish update after load");
                }
                Ok(Some(value))
            }
            None => {
                match self.nil_guard.put_nil_flag(key).await {
                    Ok(true) => debug!(key = %key, "Source reported absent, nil flag set"),
                    Ok(false) => debug!(key = %key, "Source reported absent, key already occupied"),
                    Err(e) => warn!(key = %key, error = %e, "Failed to set nil flag"),
                }
                Ok(None)
            }
        }
    }

    /// Shared tier down: answer straight from the source and cache nothing
    async fn load_degraded<T, F, Fut>(&self, key: &str, loader: F) -> CacheResult<Option<T>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>, BoxError>> + Send,
    {
        self.degraded_reads.fetch_add(1, Ordering::Relaxed);
        self.source_loads.fetch_add(1, Ordering::Relaxed);
        warn!(key = %key, "Shared tier unavailable, reading through to source without caching");
        loader().await.map_err(|source| CacheError::SourceTransport {
            key: key.to_string(),
            source,
        })
    }

    async fn read_shared<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> SharedRead<(T, serde_json::Value)> {
        match self.shared.get_timed::<serde_json::Value>(key).await {
            Ok(Some(raw)) => match serde_json::from_value::<T>(raw.clone()) {
                Ok(typed) => SharedRead::Hit((typed, raw)),
                Err(e) => {
                    warn!(key = %key, error = %e, "Shared value does not decode, treating as miss");
                    SharedRead::Miss
                }
            },
            Ok(None) => SharedRead::Miss,
            Err(CacheError::Serialization { source, .. }) => {
                warn!(
                    key = %key,
                    error = %source,
                    "Shared value is not valid JSON, treating as miss"
                );
                SharedRead::Miss
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Shared tier read failed");
                SharedRead::Degraded
            }
        }
    }

    async fn local_typed<T: DeserializeOwned>(&self, local_key: &str) -> Option<T> {
        let value = self.local.get(local_key).await?;
        match serde_json::from_value::<T>(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(key = %local_key, error = %e, "Local value does not decode, evicting");
                self.local.delete(local_key).await;
                None
            }
        }
    }

    async fn promote(&self, local_key: &str, raw: serde_json::Value) {
        self.local.put(local_key, raw, self.local.default_ttl()).await;
        debug!(key = %local_key, "Promoted shared value to local tier");
    }

    /// Write a value under the per-key lock and propagate it to every node
    ///
    /// # Errors
    ///
    /// * `LockTimeout` - another node is writing or recomputing the key
    /// * `Transport` - the shared tier rejected the write
    /// * `Bus` - the value is stored but peers were not told; their local
    ///   copies stay stale until they expire
    pub async fn put<T>(&self, key: &str, value: &T) -> CacheResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let raw = serde_json::to_value(value).map_err(|source| CacheError::Serialization {
            key: key.to_string(),
            source,
        })?;

        let Some(guard) = LockGuard::acquire(Arc::clone(&self.lock), key, self.lock_timeout).await?
        else {
            self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::LockTimeout {
                key: key.to_string(),
                timeout: self.lock_timeout,
            });
        };
        let written = self.shared.put(key, &raw).await;
        guard.release().await;
        written?;

        let message = InvalidationMessage::update(
            ChannelType::HotData,
            key,
            raw,
            Some(self.shared.default_ttl()),
        );
        self.bus.publish(&message).await?;
        debug!(key = %key, "Put value and published update");
        Ok(())
    }

    /// Remove a value everywhere
    ///
    /// Returns `true` if a value was present in the shared tier. A DELETE is
    /// published either way so that stale local copies are dropped.
    ///
    /// # Errors
    ///
    /// Returns `Transport` or `Bus` errors from the respective step.
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        let removed = self.shared.delete(key).await?;
        self.bus
            .publish(&InvalidationMessage::delete(ChannelType::HotData, key))
            .await?;
        debug!(key = %key, removed, "Deleted key and published delete");
        Ok(removed)
    }

    /// Reset a key to the clean "never cached" state
    ///
    /// Clears the shared value and the nil flag, then publishes a DELETE. The
    /// next read goes to the source.
    ///
    /// # Errors
    ///
    /// * `RefreshInconsistency` - a value or flag was present and could not be
    ///   cleared; nothing is published
    /// * `Transport` - the shared tier could not be inspected
    /// * `Bus` - the shared tier is clean but peers were not told
    pub async fn refresh(&self, key: &str) -> CacheResult<()> {
        let had_value = self.shared.exists(key).await?;
        let had_nil_flag = self.nil_guard.has_nil_flag(key).await?;

        let value_cleared = if had_value {
            match Self::clear_step(key, "value", self.shared.delete(key).await) {
                ClearStep::Done(cleared) => cleared,
                ClearStep::Vanished => {
                    Self::confirm_gone(key, "value", self.shared.exists(key).await)
                }
            }
        } else {
            true
        };
        let nil_flag_cleared = if had_nil_flag {
            match Self::clear_step(key, "nil flag", self.nil_guard.del_nil_flag(key).await) {
                ClearStep::Done(cleared) => cleared,
                ClearStep::Vanished => {
                    Self::confirm_gone(key, "nil flag", self.nil_guard.has_nil_flag(key).await)
                }
            }
        } else {
            true
        };

        if !(value_cleared && nil_flag_cleared) {
            return Err(CacheError::RefreshInconsistency {
                key: key.to_string(),
                value_cleared,
                nil_flag_cleared,
            });
        }

        self.bus
            .publish(&InvalidationMessage::delete(ChannelType::HotData, key))
            .await?;
        info!(key = %key, had_value, had_nil_flag, "Refreshed key");
        Ok(())
    }

    fn clear_step(key: &str, what: &'static str, result: CacheResult<bool>) -> ClearStep {
        match result {
            Ok(true) => ClearStep::Done(true),
            Ok(false) => ClearStep::Vanished,
            Err(e) => {
                warn!(key = %key, what, error = %e, "Refresh failed to clear");
                ClearStep::Done(false)
            }
        }
    }

    /// Decide whether an item that was not there to delete is really gone
    fn confirm_gone(key: &str, what: &'static str, still_present: CacheResult<bool>) -> bool {
        match still_present {
            Ok(false) => {
                debug!(key = %key, what, "Already cleared concurrently");
                true
            }
            Ok(true) => {
                warn!(key = %key, what, "Rewritten concurrently, refresh left residue");
                false
            }
            Err(e) => {
                warn!(key = %key, what, error = %e, "Refresh could not confirm clear");
                false
            }
        }
    }

    /// Get comprehensive cache statistics
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get_stats(&self) -> CacheManagerStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let local_hits = self.local_hits.load(Ordering::Relaxed);
        let shared_hits = self.shared_hits.load(Ordering::Relaxed);

        CacheManagerStats {
            total_requests,
            local_hits,
            shared_hits,
            nil_flag_hits: self.nil_flag_hits.load(Ordering::Relaxed),
            source_loads: self.source_loads.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            degraded_reads: self.degraded_reads.load(Ordering::Relaxed),
            hit_rate: if total_requests > 0 {
                ((local_hits + shared_hits) as f64 / total_requests as f64) * 100.0
            } else {
                0.0
            },
            in_flight_requests: self.in_flight_requests.len(),
        }
    }

    /// Local tier of this node
    #[must_use]
    pub fn local(&self) -> &Arc<LocalCache> {
        &self.local
    }

    /// Shared tier
    #[must_use]
    pub fn shared(&self) -> &Arc<SharedCache> {
        &self.shared
    }

    /// Nil flag operations
    #[must_use]
    pub fn nil_guard(&self) -> &Arc<NegativeCacheGuard> {
        &self.nil_guard
    }
}

/// Cache Manager statistics
#[derive(Debug, Clone)]
pub struct CacheManagerStats {
    pub total_requests: u64,
    pub local_hits: u64,
    pub shared_hits: u64,
    pub nil_flag_hits: u64,
    pub source_loads: u64,
    pub lock_timeouts: u64,
    pub degraded_reads: u64,
    /// Percentage of requests served by a cache tier
    pub hit_rate: f64,
    pub in_flight_requests: usize,
}
