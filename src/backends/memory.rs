//! In-Memory Backends - `DashMap` Store and Broadcast Bus
//!
//! Process-local stand-ins for Redis with the same semantics. They back the
//! integration tests (several nodes sharing one `MemoryStore` and one
//! `MemoryBus` inside a single process) and single-process deployments.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{CacheError, CacheResult};
use crate::traits::{BusTransport, SharedStore};

/// Expired entries are swept once per this many writes
const SWEEP_EVERY_WRITES: u64 = 1024;

/// Stored bytes with expiration tracking
#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn new(value: &[u8], ttl: Duration) -> Self {
        Self {
            value: value.to_vec(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Shared store backed by a concurrent `HashMap`
///
/// Expired entries are dropped when read and swept in bulk every
/// `SWEEP_EVERY_WRITES` writes, so keys that are never read again do not
/// accumulate.
///
/// Clone the `Arc` to share one store between simulated nodes. Calling
/// [`MemoryStore::set_offline`] makes every operation fail with
/// `CacheError::Transport`, which is how tests exercise degraded paths.
///
/// ```rust
/// use coherent_cache::backends::MemoryStore;
/// use coherent_cache::SharedStore;
/// use std::time::Duration;
///
/// # async fn example() -> coherent_cache::CacheResult<()> {
/// let store = MemoryStore::new();
/// store.set("app:user:1", b"alice", Duration::from_secs(60)).await?;
/// assert_eq!(store.get("app:user:1").await?, Some(b"alice".to_vec()));
/// # Ok(())
/// # }
/// ```
pub struct MemoryStore {
    map: DashMap<String, StoredValue>,
    offline: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        info!("Initializing in-memory shared store");
        Self {
            map: DashMap::new(),
            offline: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    /// Simulate the store becoming unreachable (or reachable again)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        warn!(offline, "In-memory shared store availability changed");
    }

    /// Number of successful writes, handy for asserting on cache population
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of entries held, including expired ones not yet swept
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.map.len()
    }

    /// Remove expired entries
    pub fn cleanup_expired(&self) -> usize {
        let before = self.map.len();
        self.map.retain(|_, stored| !stored.is_expired());
        let removed = before.saturating_sub(self.map.len());
        if removed > 0 {
            debug!(count = removed, "[Memory] Cleaned up expired entries");
        }
        removed
    }

    fn record_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY_WRITES == 0 {
            self.cleanup_expired();
        }
    }

    fn ensure_online(&self, op: &'static str, key: &str) -> CacheResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::transport(op, key, "in-memory store is offline"));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.ensure_online("get", key)?;
        if let Some(stored) = self.map.get(key) {
            if !stored.is_expired() {
                return Ok(Some(stored.value.clone()));
            }
        }
        self.map.remove_if(key, |_, stored| stored.is_expired());
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.ensure_online("set", key)?;
        self.map.insert(key.to_string(), StoredValue::new(value, ttl));
        self.record_write();
        debug!(key = %key, ttl_ms = ttl.as_millis(), "[Memory] Stored key with TTL");
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        self.ensure_online("set_if_absent", key)?;
        let written = match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredValue::new(value, ttl));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl));
                true
            }
        };
        if written {
            self.record_write();
        }
        Ok(written)
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> CacheResult<bool> {
        self.ensure_online("delete_if_eq", key)?;
        Ok(self
            .map
            .remove_if(key, |_, stored| {
                !stored.is_expired() && stored.value == expected
            })
            .is_some())
    }

    async fn health_check(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}

/// In-process publish/subscribe bus
///
/// Every subscription on a channel receives every payload published on it,
/// including payloads published by the same node.
pub struct MemoryBus {
    channels: DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
}

impl MemoryBus {
    /// Create a bus whose per-channel buffer holds `capacity` messages
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        })
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Number of live subscriptions on `channel`
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map_or(0, |sender| sender.receiver_count())
    }
}

#[async_trait]
impl BusTransport for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> CacheResult<()> {
        // No receivers is not an error: nobody is listening yet.
        let delivered = self.sender(channel).send(payload).unwrap_or(0);
        debug!(channel = %channel, delivered, "[Memory] Published message");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> CacheResult<BoxStream<'static, String>> {
        let receiver = self.sender(channel).subscribe();
        let channel = channel.to_string();

        let stream = futures_util::stream::unfold(receiver, move |mut receiver| {
            let channel = channel.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                channel = %channel,
                                skipped,
                                "[Memory] Subscriber lagged, messages dropped"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
