//! Benchmarks for invalidation messages and their dispatch

use std::sync::Arc;

use coherent_cache::{
    ChannelType, HotDataHandler, InvalidationBus, InvalidationConfig, InvalidationMessage,
    LocalCache, LocalCacheConfig, MemoryBus,
};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use serde_json::json;
use tokio::runtime::Runtime;

fn sample_update() -> InvalidationMessage {
    InvalidationMessage::update(
        ChannelType::HotData,
        "org:userId:42",
        json!({"orgId": 7, "name": "R&D", "members": [1, 2, 3, 4, 5]}),
        None,
    )
}

/// Benchmark message encoding and decoding
fn bench_message_codec(c: &mut Criterion) {
    let update = sample_update();
    let wire = update
        .to_json()
        .unwrap_or_else(|_| panic!("Failed to encode message"));

    c.bench_function("message_to_json", |b| {
        b.iter(|| black_box(update.to_json().ok()));
    });

    c.bench_function("message_from_json", |b| {
        b.iter(|| black_box(InvalidationMessage::from_json(black_box(&wire)).ok()));
    });
}

/// Benchmark applying a message to the local tier
fn bench_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let local = Arc::new(LocalCache::new(LocalCacheConfig::default()));
    let bus = InvalidationBus::new(MemoryBus::new(1024), InvalidationConfig::default());
    bus.register(Arc::new(HotDataHandler::new(Arc::clone(&local))));

    let update = sample_update();
    let delete = InvalidationMessage::delete(ChannelType::HotData, "org:userId:42");

    c.bench_function("dispatch_update", |b| {
        b.iter(|| rt.block_on(bus.dispatch(black_box(&update))));
    });

    c.bench_function("dispatch_delete", |b| {
        b.iter(|| rt.block_on(bus.dispatch(black_box(&delete))));
    });
}

criterion_group!(benches, bench_message_codec, bench_dispatch);
criterion_main!(benches);
