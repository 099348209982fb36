//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - A multi-node cluster over the in-memory store and bus
//! - A counting authoritative source
//! - Polling helpers for asynchronous propagation

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use coherent_cache::{
    BoxError, CacheConfig, CacheManager, CacheSystem, DomainSource, MemoryBus, MemoryStore,
};
use dashmap::DashMap;

/// Get Redis URL from environment or use default
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Create a test key with unique suffix
pub fn test_key(name: &str) -> String {
    format!("test:{}:{}", name, rand::random::<u32>())
}

/// Configuration tuned for fast tests
pub fn test_config(node_id: &str) -> CacheConfig {
    let mut config = CacheConfig::default();
    config.node_id = Some(node_id.to_string());
    config.lock.ttl = Duration::from_secs(5);
    config.lock.acquire_timeout = Duration::from_secs(2);
    config.lock.retry_interval = Duration::from_millis(10);
    config.invalidation.reconnect_delay = Duration::from_millis(100);
    config.runner.workers = 2;
    config.runner.queue_capacity = 64;
    config
}

/// Several nodes sharing one store and one bus
pub struct Cluster {
    pub store: Arc<MemoryStore>,
    pub bus: Arc<MemoryBus>,
    pub nodes: Vec<CacheSystem>,
}

impl Cluster {
    /// Start `size` nodes with the default test configuration
    pub async fn start(size: usize) -> Self {
        Self::start_with(size, |_| {}).await
    }

    /// Start `size` nodes, letting the caller adjust each node's configuration
    pub async fn start_with<F>(size: usize, tweak: F) -> Self
    where
        F: Fn(&mut CacheConfig),
    {
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryBus::new(1024);
        let mut nodes = Vec::with_capacity(size);
        for i in 0..size {
            let mut config = test_config(&format!("node-{i}"));
            tweak(&mut config);
            let node = CacheSystem::builder(config)
                .with_store(store.clone())
                .with_transport(bus.clone())
                .build()
                .await
                .expect("node should build over in-memory backends");
            nodes.push(node);
        }
        Self { store, bus, nodes }
    }

    pub fn node(&self, index: usize) -> &CacheSystem {
        &self.nodes[index]
    }

    pub fn manager(&self, index: usize) -> &Arc<CacheManager> {
        self.nodes[index].cache_manager()
    }

    /// Value held in a node's local tier for a cache key
    pub async fn local_value(&self, index: usize, key: &str) -> Option<serde_json::Value> {
        self.nodes[index]
            .local_cache()
            .get(&CacheManager::local_key(key))
            .await
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

pub type LoadFuture =
    Pin<Box<dyn Future<Output = Result<Option<serde_json::Value>, BoxError>> + Send>>;

/// Authoritative source that counts its lookups
#[derive(Clone, Default)]
pub struct CountingSource {
    inner: Arc<SourceState>,
}

#[derive(Default)]
struct SourceState {
    prefix: &'static str,
    rows: DashMap<String, serde_json::Value>,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: parking_lot::Mutex<Duration>,
}

impl CountingSource {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            inner: Arc::new(SourceState {
                prefix,
                ..SourceState::default()
            }),
        }
    }

    pub fn insert(&self, id: &str, value: serde_json::Value) {
        self.inner.rows.insert(id.to_string(), value);
    }

    pub fn remove(&self, id: &str) {
        self.inner.rows.remove(id);
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock() = delay;
    }

    /// Loader for `CacheManager::get_or_load`
    pub fn loader(&self, id: &str) -> impl FnOnce() -> LoadFuture + Send + 'static {
        let source = self.clone();
        let id = id.to_string();
        move || -> LoadFuture { Box::pin(async move { source.lookup(&id).await }) }
    }

    async fn lookup(&self, id: &str) -> Result<Option<serde_json::Value>, BoxError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.inner.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err("source connection refused".into());
        }
        Ok(self.inner.rows.get(id).map(|row| row.value().clone()))
    }
}

#[async_trait]
impl DomainSource for CountingSource {
    type Value = serde_json::Value;

    fn prefix(&self) -> &'static str {
        self.inner.prefix
    }

    async fn fetch(&self, id: &str) -> Result<Option<serde_json::Value>, BoxError> {
        self.lookup(id).await
    }
}

/// Wait for an asynchronous condition with timeout
pub async fn wait_for<F, Fut>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    use tokio::time::{Instant, sleep};

    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Assert that cache stats meet expectations
#[macro_export]
macro_rules! assert_cache_stats {
    ($manager:expr, $field:ident == $value:expr) => {
        let stats = $manager.get_stats();
        assert_eq!(
            stats.$field,
            $value,
            "Expected {} == {}, got {}",
            stringify!($field),
            $value,
            stats.$field
        );
    };
    ($manager:expr, $field:ident >= $value:expr) => {
        let stats = $manager.get_stats();
        assert!(
            stats.$field >= $value,
            "Expected {} >= {}, got {}",
            stringify!($field),
            $value,
            stats.$field
        );
    };
}
