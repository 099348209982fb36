//! Integration tests for cross-node invalidation

mod common;

use std::time::Duration;

use coherent_cache::{BusTransport, ChannelType, InvalidationMessage};
use common::{Cluster, CountingSource, wait_for};
use serde_json::json;

#[tokio::test]
async fn test_put_reaches_every_local_cache() {
    let cluster = &Cluster::start(3).await;
    let key = "org:userId:11";

    cluster.manager(0).put(key, &json!({"orgId": 1})).await.unwrap();

    for node in 0..3 {
        let arrived = wait_for(
            || async move { cluster.local_value(node, key).await == Some(json!({"orgId": 1})) },
            1000,
        )
        .await;
        assert!(arrived, "node {node} should receive the update");
    }
    assert!(!cluster.manager(1).nil_guard().has_nil_flag(key).await.unwrap());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_put_replaces_stale_local_values() {
    let cluster = &Cluster::start(2).await;
    let key = "menu:code:home";

    cluster.manager(0).put(key, &json!("v1")).await.unwrap();
    let has_v1 = || async move { cluster.local_value(1, key).await == Some(json!("v1")) };
    assert!(wait_for(has_v1, 1000).await);

    cluster.manager(1).put(key, &json!("v2")).await.unwrap();
    for node in 0..2 {
        let has_v2 = || async move { cluster.local_value(node, key).await == Some(json!("v2")) };
        assert!(wait_for(has_v2, 1000).await);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_delete_purges_every_local_cache() {
    let cluster = &Cluster::start(2).await;
    let key = "user:perms:5";

    cluster.manager(0).put(key, &json!(["read"])).await.unwrap();
    assert!(wait_for(|| async move { cluster.local_value(1, key).await.is_some() }, 1000).await);

    let removed = cluster.manager(1).delete(key).await.unwrap();
    assert!(removed);

    for node in 0..2 {
        assert!(
            wait_for(|| async move { cluster.local_value(node, key).await.is_none() }, 1000).await
        );
    }
    assert!(!cluster.manager(0).shared().exists(key).await.unwrap());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_load_on_one_node_warms_the_others() {
    let cluster = &Cluster::start(2).await;
    let source = CountingSource::new("org:userId:");
    source.insert("8", json!({"orgId": 80}));

    cluster
        .manager(0)
        .get_or_load("org:userId:8", source.loader("8"))
        .await
        .unwrap();

    let warmed = || async move { cluster.local_value(1, "org:userId:8").await.is_some() };
    assert!(wait_for(warmed, 1000).await);
    let on_peer = cluster
        .manager(1)
        .get_or_load("org:userId:8", source.loader("8"))
        .await
        .unwrap();
    assert_eq!(on_peer, Some(json!({"orgId": 80})));
    assert_eq!(source.calls(), 1);
    assert_cache_stats!(cluster.manager(1), local_hits == 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_delivery_is_idempotent() {
    let cluster = &Cluster::start(2).await;
    let bus = cluster.node(0).invalidation_bus();
    let update = InvalidationMessage::update(ChannelType::HotData, "k", json!({"n": 1}), None);

    bus.publish(&update).await.unwrap();
    bus.publish(&update).await.unwrap();
    assert!(
        wait_for(
            || async move { cluster.node(1).invalidation_bus().stats().updates_received == 2 },
            1000
        )
        .await
    );
    assert_eq!(cluster.local_value(1, "k").await, Some(json!({"n": 1})));

    let delete = InvalidationMessage::delete(ChannelType::HotData, "k");
    bus.publish(&delete).await.unwrap();
    bus.publish(&delete).await.unwrap();
    assert!(
        wait_for(
            || async move { cluster.node(1).invalidation_bus().stats().deletes_received == 2 },
            1000
        )
        .await
    );
    assert_eq!(cluster.local_value(1, "k").await, None);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_unknown_and_malformed_messages_are_tolerated() {
    let cluster = &Cluster::start(1).await;
    let channel = "cache:invalidate";

    cluster
        .bus
        .publish(
            channel,
            r#"{"channelType":"BRAND_NEW","operation":"DELETE","key":"k"}"#.to_string(),
        )
        .await
        .unwrap();
    cluster
        .bus
        .publish(channel, "not json at all".to_string())
        .await
        .unwrap();
    // Registered type but no handler on this node
    cluster
        .node(0)
        .invalidation_bus()
        .publish(&InvalidationMessage::delete(ChannelType::Tenant, "t1"))
        .await
        .unwrap();

    let bus = cluster.node(0).invalidation_bus();
    assert!(wait_for(|| async move { bus.stats().messages_ignored == 2 }, 1000).await);
    assert!(wait_for(|| async move { bus.stats().processing_errors == 1 }, 1000).await);

    // The subscriber keeps working afterwards
    cluster.manager(0).put("after", &json!(true)).await.unwrap();
    assert!(
        wait_for(|| async move { cluster.local_value(0, "after").await.is_some() }, 1000).await
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_update_ttl_bounds_local_lifetime() {
    let cluster = &Cluster::start(1).await;
    let bus = cluster.node(0).invalidation_bus();

    bus.publish(&InvalidationMessage::update(
        ChannelType::HotData,
        "short",
        json!(1),
        Some(Duration::from_millis(50)),
    ))
    .await
    .unwrap();
    assert!(
        wait_for(|| async move { cluster.local_value(0, "short").await.is_some() }, 1000).await
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.local_value(0, "short").await, None);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_applying_messages() {
    let cluster = &Cluster::start(2).await;
    cluster.node(1).shutdown().await;

    cluster.manager(0).put("k", &json!(1)).await.unwrap();
    assert!(wait_for(|| async move { cluster.local_value(0, "k").await.is_some() }, 1000).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.local_value(1, "k").await, None);
    assert_eq!(cluster.node(1).invalidation_bus().stats().messages_received, 0);

    cluster.shutdown().await;
}
