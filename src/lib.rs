//! Coherent Cache
//!
//! A two-tier cache core for horizontally scaled services:
//! - **Local Cache**: per-node in-memory tier with Moka (no network)
//! - **Shared Cache**: cluster-wide tier over a distributed store (Redis by default)
//! - **Nil Flags**: negative caching of confirmed-absent keys (cache penetration)
//! - **Distributed Lock**: single-flight recompute across nodes (cache breakdown)
//! - **Invalidation Bus**: pub/sub that keeps every node's local tier coherent
//! - **Async Task Runner**: bounded background pool with catch-log-continue
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use coherent_cache::{CacheConfig, CacheSystem};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheSystem::builder(CacheConfig::from_env()?).build().await?;
//!
//!     let org: Option<String> = cache
//!         .cache_manager()
//!         .get_or_load("org:userId:42", || async { Ok(Some("R&D".to_string())) })
//!         .await?;
//!
//!     // Source data changed: reset the key on every node
//!     cache.cache_manager().refresh("org:userId:42").await?;
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Request → Local (Moka) → Shared (Redis) → nil flag → lock → Source
//!           ↓ Hit           ↓ Hit            ↓ Set      ↓ Loaded
//!           Return          Promote to Local  Absent     Shared + UPDATE to all nodes
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod backends;
pub mod builder;
pub mod cache_manager;
pub mod config;
pub mod domain;
pub mod error;
pub mod invalidation;
pub mod local_cache;
pub mod lock;
pub mod negative_cache;
pub mod shared_cache;
pub mod task_runner;
pub mod telemetry;
pub mod traits;

pub use backends::{MemoryBus, MemoryStore};
#[cfg(feature = "redis")]
pub use backends::{RedisPubSub, RedisStore};
pub use builder::CacheSystemBuilder;
pub use cache_manager::{CacheManager, CacheManagerStats};
pub use config::{
    CacheConfig, InvalidationConfig, LocalCacheConfig, LockConfig, NilFlagConfig,
    RejectionPolicy, SharedCacheConfig, TaskRunnerConfig,
};
pub use domain::{DomainCache, DomainSource, Refreshable, UserCacheRefresher, prefixes};
pub use error::{BoxError, CacheError, CacheResult};
pub use invalidation::{
    ChannelType, HotDataHandler, InvalidationBus, InvalidationHandler, InvalidationMessage,
    InvalidationStats, Operation,
};
pub use local_cache::{LocalCache, LocalCacheStats};
pub use lock::{LockGuard, LockHandle, StoreLock};
pub use negative_cache::NegativeCacheGuard;
pub use shared_cache::SharedCache;
pub use task_runner::{AsyncTaskRunner, TaskRunnerStats};
pub use traits::{BusTransport, DistributedLock, SharedStore};

// Re-export async_trait for user convenience
pub use async_trait::async_trait;

/// One cache node: the context object passed to request handlers
///
/// Cheap to clone; clones share the same components.
#[derive(Clone)]
pub struct CacheSystem {
    node_id: Arc<str>,
    cache_manager: Arc<CacheManager>,
    invalidation_bus: Arc<InvalidationBus>,
    task_runner: Arc<AsyncTaskRunner>,
    subscriber: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl CacheSystem {
    /// Start building a node
    #[must_use]
    pub fn builder(config: CacheConfig) -> CacheSystemBuilder {
        CacheSystemBuilder::new(config)
    }

    /// Node with default Redis backends, configured from the environment
    ///
    /// # Errors
    ///
    /// Returns `Config` for bad environment values, `Transport`/`Bus` if Redis
    /// is unreachable.
    #[cfg(feature = "redis")]
    pub async fn from_env() -> CacheResult<Self> {
        CacheSystemBuilder::new(CacheConfig::from_env()?).build().await
    }

    pub(crate) fn from_parts(
        node_id: String,
        cache_manager: Arc<CacheManager>,
        invalidation_bus: Arc<InvalidationBus>,
        task_runner: Arc<AsyncTaskRunner>,
        subscriber: JoinHandle<()>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            cache_manager,
            invalidation_bus,
            task_runner,
            subscriber: Arc::new(parking_lot::Mutex::new(Some(subscriber))),
        }
    }

    /// Identity of this node
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get reference to cache manager (primary interface)
    #[must_use]
    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache_manager
    }

    /// This node's local tier
    #[must_use]
    pub fn local_cache(&self) -> &Arc<LocalCache> {
        self.cache_manager.local()
    }

    /// Invalidation bus, for publishing custom messages and reading stats
    #[must_use]
    pub fn invalidation_bus(&self) -> &Arc<InvalidationBus> {
        &self.invalidation_bus
    }

    /// Background task pool
    #[must_use]
    pub fn task_runner(&self) -> &Arc<AsyncTaskRunner> {
        &self.task_runner
    }

    /// Perform health check on both tiers
    ///
    /// Returns `true` only if the local tier works and the shared store
    /// answers. A shared outage is survivable (reads degrade to the source)
    /// but is reported as unhealthy.
    pub async fn health_check(&self) -> bool {
        let local_ok = self.cache_manager.local().health_check().await;
        let shared_ok = self.cache_manager.shared().health_check().await;

        if local_ok && shared_ok {
            info!(node_id = %self.node_id, "Cache health check passed");
            true
        } else {
            warn!(node_id = %self.node_id, local_ok, shared_ok, "Cache health check failed");
            false
        }
    }

    /// Stop the invalidation subscriber and drain the task runner
    pub async fn shutdown(&self) {
        self.invalidation_bus.shutdown();
        let subscriber = self.subscriber.lock().take();
        if let Some(subscriber) = subscriber {
            if let Err(e) = subscriber.await {
                warn!(error = %e, "Invalidation subscriber ended abnormally");
            }
        }
        self.task_runner.shutdown().await;
        info!(node_id = %self.node_id, "Cache node shut down");
    }
}
