//! Integration tests for background work on a cache node

mod common;

use std::sync::Arc;

use common::{Cluster, CountingSource, wait_for};
use serde_json::json;

#[tokio::test]
async fn test_background_warm_up_survives_failing_tasks() {
    let cluster = &Cluster::start(2).await;
    let source = CountingSource::new("menu:code:");
    for code in ["a", "b", "c"] {
        source.insert(code, json!({"code": code}));
    }

    let node = cluster.node(0);
    let runner = node.task_runner();

    assert!(runner.submit("warm-up-failing", async { anyhow::bail!("source offline") }));
    for code in ["a", "b", "c"] {
        let manager = Arc::clone(node.cache_manager());
        let loader = source.loader(code);
        let key = format!("menu:code:{code}");
        assert!(runner.submit(format!("warm-up-{code}"), async move {
            manager.get_or_load(&key, loader).await?;
            Ok(())
        }));
    }

    // Warmed values reach the peer through the bus
    for code in ["a", "b", "c"] {
        let key = format!("menu:code:{code}");
        let key = key.as_str();
        assert!(
            wait_for(|| async move { cluster.local_value(1, key).await.is_some() }, 2000).await
        );
    }
    assert_eq!(source.calls(), 3);

    assert!(wait_for(|| async move { runner.stats().completed == 3 }, 1000).await);
    assert!(wait_for(|| async move { runner.stats().failed == 1 }, 1000).await);
    assert_eq!(runner.stats().rejected, 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_source_error_inside_task_is_contained() {
    let cluster = &Cluster::start(1).await;
    let source = CountingSource::new("org:userId:");
    source.set_failing(true);

    let node = cluster.node(0);
    let manager = Arc::clone(node.cache_manager());
    let loader = source.loader("1");
    assert!(node.task_runner().submit("refresh-org", async move {
        manager.get_or_load("org:userId:1", loader).await?;
        Ok(())
    }));

    let runner = node.task_runner();
    assert!(wait_for(|| async move { runner.stats().failed == 1 }, 1000).await);

    // Pool still accepts and runs work
    assert!(runner.submit("noop", async { Ok(()) }));
    assert!(wait_for(|| async move { runner.stats().completed == 1 }, 1000).await);

    cluster.shutdown().await;
}
