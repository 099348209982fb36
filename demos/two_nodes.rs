//! Two cache nodes sharing one in-process store and bus
//!
//! ```text
//! cargo run --example two_nodes
//! RUST_LOG=coherent_cache=debug cargo run --example two_nodes
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use coherent_cache::{
    BoxError, CacheConfig, CacheSystem, DomainCache, DomainSource, MemoryBus, MemoryStore,
    async_trait, prefixes, telemetry,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Org {
    id: u64,
    name: String,
}

/// Stand-in for the user directory database
#[derive(Clone, Default)]
struct OrgDirectory {
    lookups: Arc<AtomicUsize>,
}

#[async_trait]
impl DomainSource for OrgDirectory {
    type Value = Org;

    fn prefix(&self) -> &'static str {
        prefixes::ORG_BY_USER_ID
    }

    async fn fetch(&self, user_id: &str) -> Result<Option<Org>, BoxError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(match user_id {
            "42" => Some(Org { id: 7, name: "R&D".to_string() }),
            _ => None,
        })
    }
}

async fn node(
    name: &str,
    store: Arc<MemoryStore>,
    bus: Arc<MemoryBus>,
) -> anyhow::Result<CacheSystem> {
    let mut config = CacheConfig::default();
    config.node_id = Some(name.to_string());
    Ok(CacheSystem::builder(config)
        .with_store(store)
        .with_transport(bus)
        .build()
        .await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("coherent_cache=info,two_nodes=info");

    let store = Arc::new(MemoryStore::new());
    let bus = MemoryBus::new(1024);
    let a = node("node-a", Arc::clone(&store), Arc::clone(&bus)).await?;
    let b = node("node-b", store, bus).await?;

    let directory = OrgDirectory::default();
    let orgs_a = DomainCache::new(Arc::clone(a.cache_manager()), directory.clone());
    let orgs_b = DomainCache::new(Arc::clone(b.cache_manager()), directory.clone());

    // Both nodes miss at once; only one reaches the directory
    let (from_a, from_b) = tokio::join!(orgs_a.get("42"), orgs_b.get("42"));
    info!(
        ?from_a,
        ?from_b,
        lookups = directory.lookups.load(Ordering::SeqCst),
        "Concurrent lookups"
    );

    // Unknown users are remembered as absent
    for _ in 0..3 {
        orgs_b.get("404").await?;
    }
    info!(lookups = directory.lookups.load(Ordering::SeqCst), "After repeated misses");

    // Source changed: purge everywhere
    orgs_a.refresh("42").await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    info!(
        local_a = ?a.local_cache().get("hot_data:org:userId:42").await,
        local_b = ?b.local_cache().get("hot_data:org:userId:42").await,
        "After refresh"
    );

    info!(stats = ?a.cache_manager().get_stats(), "node-a");
    info!(stats = ?b.cache_manager().get_stats(), "node-b");
    info!(stats = ?b.invalidation_bus().stats(), "node-b bus");

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}
