//! Cache System Builder
//!
//! Wires the components of one cache node together. Backends are injected as
//! capability trait objects; anything not injected falls back to Redis when
//! the `redis` feature is enabled.
//!
//! # Example: Using Default Backends
//!
//! ```rust,no_run
//! use coherent_cache::{CacheConfig, CacheSystemBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheSystemBuilder::new(CacheConfig::from_env()?)
//!         .build()
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: In-Process Backends
//!
//! ```rust,ignore
//! use coherent_cache::{CacheConfig, CacheSystemBuilder, MemoryBus, MemoryStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let bus = MemoryBus::new(1024);
//!
//! let node = CacheSystemBuilder::new(CacheConfig::default())
//!     .with_store(store)
//!     .with_transport(bus)
//!     .build()
//!     .await?;
//! ```

use std::sync::Arc;

use tracing::info;

use crate::cache_manager::CacheManager;
use crate::config::CacheConfig;
use crate::error::CacheResult;
use crate::invalidation::{HotDataHandler, InvalidationBus, InvalidationHandler};
use crate::local_cache::LocalCache;
use crate::lock::StoreLock;
use crate::negative_cache::NegativeCacheGuard;
use crate::shared_cache::SharedCache;
use crate::task_runner::AsyncTaskRunner;
use crate::traits::{BusTransport, DistributedLock, SharedStore};
use crate::CacheSystem;

/// Builder for constructing a [`CacheSystem`] node
pub struct CacheSystemBuilder {
    config: CacheConfig,
    store: Option<Arc<dyn SharedStore>>,
    transport: Option<Arc<dyn BusTransport>>,
    lock: Option<Arc<dyn DistributedLock>>,
    handlers: Vec<Arc<dyn InvalidationHandler>>,
}

impl CacheSystemBuilder {
    /// Create a builder with no custom backends configured
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            store: None,
            transport: None,
            lock: None,
            handlers: Vec::new(),
        }
    }

    /// Shared store for values, nil flags and (by default) locks
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Carrier for invalidation messages
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn BusTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Lock service; defaults to a [`StoreLock`] over the shared store
    #[must_use]
    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Extra invalidation handler, in addition to the built-in hot-data one
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn InvalidationHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Build the node and start its invalidation subscriber
    ///
    /// # Errors
    ///
    /// * `Config` - invalid configuration, or a backend is missing and the
    ///   `redis` feature is disabled
    /// * `Transport` / `Bus` - the default Redis backends could not connect
    pub async fn build(self) -> CacheResult<CacheSystem> {
        self.config.validate()?;
        let config = self.config;
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        info!(node_id = %node_id, "Building cache node");

        let (store, transport) = resolve_backends(&config, self.store, self.transport).await?;
        info!(
            store = store.name(),
            transport = transport.name(),
            "Cache backends ready"
        );

        let local = Arc::new(LocalCache::new(config.local));
        let shared = Arc::new(SharedCache::new(Arc::clone(&store), &config.shared));
        let nil_guard = Arc::new(NegativeCacheGuard::new(Arc::clone(&shared), config.nil_flag));
        let lock: Arc<dyn DistributedLock> = match self.lock {
            Some(lock) => lock,
            None => Arc::new(StoreLock::new(
                Arc::clone(&store),
                shared.key_prefix(),
                node_id.clone(),
                config.lock,
            )),
        };

        let bus = Arc::new(InvalidationBus::new(transport, config.invalidation.clone()));
        bus.register(Arc::new(HotDataHandler::new(Arc::clone(&local))));
        for handler in self.handlers {
            bus.register(handler);
        }
        let subscriber = bus.start().await?;

        let cache_manager = Arc::new(CacheManager::new(
            Arc::clone(&local),
            shared,
            nil_guard,
            lock,
            Arc::clone(&bus),
            config.lock.acquire_timeout,
        ));
        let task_runner = Arc::new(AsyncTaskRunner::new(config.runner));

        info!(node_id = %node_id, "Cache node built successfully");

        Ok(CacheSystem::from_parts(
            node_id,
            cache_manager,
            bus,
            task_runner,
            subscriber,
        ))
    }
}

#[cfg(feature = "redis")]
async fn resolve_backends(
    config: &CacheConfig,
    store: Option<Arc<dyn SharedStore>>,
    transport: Option<Arc<dyn BusTransport>>,
) -> CacheResult<(Arc<dyn SharedStore>, Arc<dyn BusTransport>)> {
    use crate::backends::{RedisPubSub, RedisStore};

    if let (Some(store), Some(transport)) = (&store, &transport) {
        return Ok((Arc::clone(store), Arc::clone(transport)));
    }

    info!(redis_url = %config.redis_url, "Using default Redis backends");
    let redis = Arc::new(RedisStore::with_url(&config.redis_url).await?);
    let transport: Arc<dyn BusTransport> = match transport {
        Some(transport) => transport,
        None => Arc::new(RedisPubSub::new(&config.redis_url, redis.connection())?),
    };
    let store: Arc<dyn SharedStore> = match store {
        Some(store) => store,
        None => redis,
    };
    Ok((store, transport))
}

#[cfg(not(feature = "redis"))]
async fn resolve_backends(
    _config: &CacheConfig,
    store: Option<Arc<dyn SharedStore>>,
    transport: Option<Arc<dyn BusTransport>>,
) -> CacheResult<(Arc<dyn SharedStore>, Arc<dyn BusTransport>)> {
    match (store, transport) {
        (Some(store), Some(transport)) => Ok((store, transport)),
        _ => Err(crate::error::CacheError::Config(
            "a shared store and a bus transport are required without the `redis` feature".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryBus, MemoryStore};
    use crate::error::CacheError;

    #[tokio::test]
    async fn test_build_with_memory_backends() {
        let mut config = CacheConfig::default();
        config.node_id = Some("node-a".to_string());

        let system = CacheSystemBuilder::new(config)
            .with_store(Arc::new(MemoryStore::new()))
            .with_transport(MemoryBus::new(16))
            .build()
            .await
            .unwrap();

        assert_eq!(system.node_id(), "node-a");
        assert!(system.health_check().await);
        system.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = CacheConfig::default();
        config.runner.workers = 0;

        let result = CacheSystemBuilder::new(config)
            .with_store(Arc::new(MemoryStore::new()))
            .with_transport(MemoryBus::new(16))
            .build()
            .await;
        assert!(matches!(result, Err(CacheError::Config(_))));
    }
}
