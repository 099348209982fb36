//! Local Cache - Moka In-Memory Tier
//!
//! Process-local hot tier. Never touches the network and never notifies other
//! nodes; it is mutated by this node's invalidation handlers and by L2-to-L1
//! promotion on read.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use moka::future::Cache;
use tracing::{debug, info};

use crate::config::LocalCacheConfig;

/// Cache entry with TTL information
#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: serde_json::Value, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Moka in-memory cache with per-key TTL support
///
/// Capacity eviction is Moka's (TinyLFU); per-entry TTL is checked on read so
/// an expired entry is never returned. The configured default TTL also acts as
/// Moka's global time-to-live safety net.
pub struct LocalCache {
    cache: Cache<String, CacheEntry>,
    default_ttl: Duration,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    sets: Arc<AtomicU64>,
}

impl LocalCache {
    /// Create new local cache
    #[must_use]
    pub fn new(config: LocalCacheConfig) -> Self {
        info!("Initializing local cache (Moka)");

        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.default_ttl)
            .time_to_idle(config.time_to_idle)
            .build();

        info!(
            capacity = config.max_capacity,
            ttl_secs = config.default_ttl.as_secs(),
            "Local cache initialized with per-key TTL support"
        );

        Self {
            cache,
            default_ttl: config.default_ttl,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            sets: Arc::new(AtomicU64::new(0)),
        }
    }

    /// TTL used when the caller does not supply one
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Get value; expired entries are removed and reported absent
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        if let Some(entry) = self.cache.get(key).await {
            if entry.is_expired() {
                self.cache.remove(key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value)
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Store value with TTL, clamped to the configured default
    pub async fn put(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let ttl = ttl.min(self.default_ttl);
        self.cache
            .insert(key.to_string(), CacheEntry::new(value, ttl))
            .await;
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_ms = ttl.as_millis(), "[Local] Cached key with TTL");
    }

    /// Evict a single key
    pub async fn delete(&self, key: &str) {
        self.cache.remove(key).await;
        debug!(key = %key, "[Local] Evicted key");
    }

    /// Evict everything held by this node
    pub async fn flush(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        info!("[Local] Flushed all entries");
    }

    /// Approximate number of entries (Moka counts lazily)
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Round-trip a test value through the cache
    pub async fn health_check(&self) -> bool {
        let test_key = "__health_check_local";
        let test_value = serde_json::json!({"test": true});

        self.put(test_key, test_value.clone(), Duration::from_secs(60))
            .await;
        let healthy = self.get(test_key).await.as_ref() == Some(&test_value);
        self.delete(test_key).await;
        healthy
    }

    /// Snapshot of counters
    #[must_use]
    pub fn stats(&self) -> LocalCacheStats {
        LocalCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            size: self.cache.entry_count(),
        }
    }
}

/// Local cache statistics
#[derive(Debug, Clone, Copy)]
pub struct LocalCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> LocalCache {
        LocalCache::new(LocalCacheConfig::default())
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let cache = cache();
        cache.put("hot_data:a", json!({"id": 1}), Duration::from_secs(60)).await;
        assert_eq!(cache.get("hot_data:a").await, Some(json!({"id": 1})));

        cache.delete("hot_data:a").await;
        assert_eq!(cache.get("hot_data:a").await, None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let cache = cache();
        cache.put("short", json!(1), Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("short").await, None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_flush_clears_everything() {
        let cache = cache();
        for i in 0..10 {
            cache.put(&format!("k{i}"), json!(i), Duration::from_secs(60)).await;
        }
        cache.flush().await;
        for i in 0..10 {
            assert_eq!(cache.get(&format!("k{i}")).await, None);
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        assert!(cache().health_check().await);
    }
}
