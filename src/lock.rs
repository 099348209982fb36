//! Distributed Lock - Single-Flight Recompute
//!
//! Cluster-wide mutual exclusion built on the shared store's `set_if_absent`
//! and compare-and-delete primitives:
//!
//! ```text
//! lock:   SET <prefix>:lock:<key> <token> NX PX <ttl>   (retry until timeout)
//! unlock: DEL <prefix>:lock:<key> IF value == <token>
//! ```
//!
//! Each acquisition gets a fresh random token, so a holder whose lease expired
//! can never release the lock of the node that took over. Lease expiry is the
//! recovery path for a holder that crashed without unlocking.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::CacheResult;
use crate::traits::{DistributedLock, SharedStore};

/// Proof of a held lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// Cache key the lock protects
    pub key: String,
    /// Identity of the holding node
    pub holder: String,
    /// Random per-acquisition token stored as the lease value
    pub token: String,
    /// Wall-clock acquisition time
    pub acquired_at: SystemTime,
    /// Lease length; the lock frees itself after this
    pub ttl: Duration,
}

impl LockHandle {
    /// Whether the lease has run out (the lock may now belong to someone else)
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.acquired_at
            .elapsed()
            .is_ok_and(|elapsed| elapsed >= self.ttl)
    }
}

/// [`DistributedLock`] over any [`SharedStore`]
pub struct StoreLock {
    store: Arc<dyn SharedStore>,
    key_prefix: String,
    node_id: String,
    config: LockConfig,
}

impl StoreLock {
    /// Create a lock service whose leases live under `<key_prefix>:lock:`
    pub fn new(
        store: Arc<dyn SharedStore>,
        key_prefix: impl Into<String>,
        node_id: impl Into<String>,
        config: LockConfig,
    ) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            node_id: node_id.into(),
            config,
        }
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.key_prefix, key)
    }

    fn next_backoff(&self) -> Duration {
        let base = self.config.retry_interval;
        let jitter_cap = u64::try_from(base.as_millis() / 2).unwrap_or(0);
        let jitter = if jitter_cap > 0 {
            rand::thread_rng().gen_range(0..=jitter_cap)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }
}

#[async_trait]
impl DistributedLock for StoreLock {
    async fn lock(&self, key: &str, timeout: Duration) -> CacheResult<Option<LockHandle>> {
        let lock_key = self.lock_key(key);
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;

        loop {
            if self
                .store
                .set_if_absent(&lock_key, token.as_bytes(), self.config.ttl)
                .await?
            {
                debug!(key = %key, holder = %self.node_id, "[Lock] Acquired");
                return Ok(Some(LockHandle {
                    key: key.to_string(),
                    holder: self.node_id.clone(),
                    token,
                    acquired_at: SystemTime::now(),
                    ttl: self.config.ttl,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    key = %key,
                    timeout_ms = timeout.as_millis(),
                    "[Lock] Not acquired within timeout"
                );
                return Ok(None);
            }
            tokio::time::sleep(self.next_backoff().min(deadline - now)).await;
        }
    }

    async fn unlock(&self, handle: &LockHandle) -> CacheResult<bool> {
        let released = self
            .store
            .delete_if_eq(&self.lock_key(&handle.key), handle.token.as_bytes())
            .await?;
        if released {
            debug!(key = %handle.key, "[Lock] Released");
        } else {
            warn!(
                key = %handle.key,
                holder = %handle.holder,
                "[Lock] Lease expired before release; recompute outlived the lock TTL"
            );
        }
        Ok(released)
    }
}

/// Scoped lock acquisition
///
/// Call [`LockGuard::release`] on every path. If the guard is dropped without
/// being released (a panic inside the critical section), release is scheduled
/// on the current Tokio runtime; failing that, the lease simply expires.
pub struct LockGuard {
    lock: Arc<dyn DistributedLock>,
    handle: Option<LockHandle>,
}

impl LockGuard {
    /// Acquire `key`, waiting at most `timeout`
    ///
    /// # Returns
    ///
    /// * `Ok(Some(guard))` - acquired
    /// * `Ok(None)` - contention, not acquired in time
    /// * `Err(e)` - lock service unreachable
    pub async fn acquire(
        lock: Arc<dyn DistributedLock>,
        key: &str,
        timeout: Duration,
    ) -> CacheResult<Option<Self>> {
        let handle = lock.lock(key, timeout).await?;
        Ok(handle.map(|handle| Self {
            lock,
            handle: Some(handle),
        }))
    }

    /// The held lease
    #[must_use]
    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    /// Release the lock; failures are logged, the lease expiry covers them
    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.lock.unlock(&handle).await {
                warn!(key = %handle.key, error = %e, "[Lock] Release failed; lease will expire");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let lock = Arc::clone(&self.lock);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = lock.unlock(&handle).await {
                    warn!(
                        key = %handle.key,
                        error = %e,
                        "[Lock] Deferred release failed; lease will expire"
                    );
                }
            });
        } else {
            warn!(key = %handle.key, "[Lock] Guard dropped outside a runtime; lease will expire");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStore;

    fn lock_service(ttl: Duration) -> Arc<StoreLock> {
        let store = Arc::new(MemoryStore::new());
        Arc::new(StoreLock::new(
            store,
            "app",
            "node-a",
            LockConfig {
                ttl,
                acquire_timeout: Duration::from_millis(200),
                retry_interval: Duration::from_millis(10),
            },
        ))
    }

    #[tokio::test]
    async fn test_exclusive_until_unlocked() {
        let lock = lock_service(Duration::from_secs(5));
        let first = lock.lock("org:userId:1", Duration::from_millis(50)).await.unwrap();
        let first = first.unwrap_or_else(|| panic!("first lock should be acquired"));
        assert_eq!(first.holder, "node-a");

        let second = lock.lock("org:userId:1", Duration::from_millis(50)).await.unwrap();
        assert!(second.is_none(), "contended lock must time out with None");

        assert!(lock.unlock(&first).await.unwrap());
        let third = lock.lock("org:userId:1", Duration::from_millis(50)).await.unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_not_reentrant() {
        let lock = lock_service(Duration::from_secs(5));
        let held = lock.lock("k", Duration::from_millis(10)).await.unwrap();
        assert!(held.is_some());
        assert!(lock.lock("k", Duration::from_millis(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over_and_not_released_by_old_holder() {
        let lock = lock_service(Duration::from_millis(40));
        let stale = lock
            .lock("k", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("acquire"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(stale.is_expired());

        let fresh = lock.lock("k", Duration::from_millis(10)).await.unwrap();
        assert!(fresh.is_some(), "expired lease must be acquirable");

        assert!(!lock.unlock(&stale).await.unwrap(), "stale holder must not release the new lease");
        assert!(lock.lock("k", Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let lock = lock_service(Duration::from_secs(5));
        let held = lock
            .lock("k", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("acquire"));

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.lock("k", Duration::from_millis(500)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        lock.unlock(&held).await.unwrap();

        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test]
    async fn test_guard_release_and_drop() {
        let lock = lock_service(Duration::from_secs(5));
        let dyn_lock: Arc<dyn DistributedLock> = lock.clone();

        let guard = LockGuard::acquire(Arc::clone(&dyn_lock), "k", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("acquire"));
        guard.release().await;
        assert!(lock.lock("k", Duration::from_millis(10)).await.unwrap().is_some());

        let dropped = LockGuard::acquire(Arc::clone(&dyn_lock), "other", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(dropped.is_some());
        drop(dropped);
        let reacquired = lock.lock("other", Duration::from_millis(200)).await.unwrap();
        assert!(reacquired.is_some(), "dropped guard must schedule release");
    }
}
