//! Cache invalidation and synchronization module
//!
//! Cross-node coherence of the local tier. A node that mutates the shared
//! cache publishes an [`InvalidationMessage`]; every node, the publisher
//! included, runs the handlers registered for the message's channel type.
//!
//! Delivery is at-most-once. A node that is disconnected while a message is
//! published keeps its stale local entry until that entry's own TTL runs out.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::InvalidationConfig;
use crate::error::{CacheError, CacheResult};
use crate::local_cache::LocalCache;
use crate::traits::BusTransport;

/// Kind of cached data a message refers to
///
/// Values this build does not know deserialize as `Unknown` and are ignored,
/// so newer publishers never break older subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelType {
    HotData,
    Dict,
    User,
    Menu,
    Org,
    Tenant,
    #[serde(other)]
    Unknown,
}

impl ChannelType {
    /// Prefix of local keys owned by this channel type
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::HotData => "hot_data",
            Self::Dict => "dict",
            Self::User => "user",
            Self::Menu => "menu",
            Self::Org => "org",
            Self::Tenant => "tenant",
            Self::Unknown => "unknown",
        }
    }

    /// Local cache key derived from a shared cache key
    #[must_use]
    pub fn local_key(self, key: &str) -> String {
        format!("{}:{}", self.prefix(), key)
    }
}

/// What happened to the key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Update,
    Delete,
}

/// Invalidation message sent across cache nodes
///
/// Wire format (JSON):
///
/// ```json
/// {"channelType":"HOT_DATA","operation":"UPDATE","key":"org:userId:42","value":{...},"ttlMs":60000}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    pub channel_type: ChannelType,
    pub operation: Operation,
    pub key: String,
    /// New value; present only on `Update`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Upper bound for the local TTL of an `Update`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl InvalidationMessage {
    /// Create an Update message
    pub fn update(
        channel_type: ChannelType,
        key: impl Into<String>,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            channel_type,
            operation: Operation::Update,
            key: key.into(),
            value: Some(value),
            ttl_ms: ttl.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Create a Delete message
    pub fn delete(channel_type: ChannelType, key: impl Into<String>) -> Self {
        Self {
            channel_type,
            operation: Operation::Delete,
            key: key.into(),
            value: None,
            ttl_ms: None,
        }
    }

    /// Serialize to JSON for transmission
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Serialization` if the value cannot be encoded.
    pub fn to_json(&self) -> CacheResult<String> {
        serde_json::to_string(self).map_err(|source| CacheError::Serialization {
            key: self.key.clone(),
            source,
        })
    }

    /// Deserialize from JSON
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` on malformed payloads.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Get TTL as Duration if present
    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

/// Applies invalidation messages of one channel type to this node
///
/// Handlers must be idempotent: applying a message twice leaves the same state
/// as applying it once.
#[async_trait]
pub trait InvalidationHandler: Send + Sync {
    /// Channel type this handler consumes
    fn channel_type(&self) -> ChannelType;

    /// Apply one message
    async fn handle(&self, message: &InvalidationMessage) -> CacheResult<()>;
}

/// Keeps the local tier in step with shared hot data
pub struct HotDataHandler {
    local: Arc<LocalCache>,
}

impl HotDataHandler {
    pub fn new(local: Arc<LocalCache>) -> Self {
        Self { local }
    }
}

#[async_trait]
impl InvalidationHandler for HotDataHandler {
    fn channel_type(&self) -> ChannelType {
        ChannelType::HotData
    }

    async fn handle(&self, message: &InvalidationMessage) -> CacheResult<()> {
        if message.key.is_empty() {
            return Ok(());
        }

        let local_key = ChannelType::HotData.local_key(&message.key);
        match (message.operation, &message.value) {
            (Operation::Update, Some(value)) => {
                let ttl = message.ttl().unwrap_or_else(|| self.local.default_ttl());
                self.local.put(&local_key, value.clone(), ttl).await;
            }
            (Operation::Update, None) => {
                // An update without a value cannot be applied; evicting keeps
                // the node from serving the superseded entry.
                warn!(key = %message.key, "Update message without value, evicting instead");
                self.local.delete(&local_key).await;
            }
            (Operation::Delete, _) => {
                self.local.delete(&local_key).await;
            }
        }
        Ok(())
    }
}

/// Statistics for invalidation operations
#[derive(Debug, Default, Clone)]
pub struct InvalidationStats {
    /// Number of invalidation messages published
    pub messages_sent: u64,

    /// Number of invalidation messages received
    pub messages_received: u64,

    /// Number of Update operations applied
    pub updates_received: u64,

    /// Number of Delete operations applied
    pub deletes_received: u64,

    /// Messages with no registered handler (unknown channel types included)
    pub messages_ignored: u64,

    /// Number of failed message processing attempts
    pub processing_errors: u64,
}

/// Thread-safe statistics for invalidation operations
#[derive(Debug, Default)]
struct AtomicInvalidationStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    updates_received: AtomicU64,
    deletes_received: AtomicU64,
    messages_ignored: AtomicU64,
    processing_errors: AtomicU64,
}

impl AtomicInvalidationStats {
    fn snapshot(&self) -> InvalidationStats {
        InvalidationStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            updates_received: self.updates_received.load(Ordering::Relaxed),
            deletes_received: self.deletes_received.load(Ordering::Relaxed),
            messages_ignored: self.messages_ignored.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
        }
    }
}

type HandlerRegistry = RwLock<HashMap<ChannelType, Vec<Arc<dyn InvalidationHandler>>>>;

/// Publish/subscribe invalidation bus for one node
///
/// Register handlers, then [`start`](Self::start) the subscriber. Messages are
/// dispatched sequentially in receipt order.
pub struct InvalidationBus {
    transport: Arc<dyn BusTransport>,
    config: InvalidationConfig,
    handlers: Arc<HandlerRegistry>,
    stats: Arc<AtomicInvalidationStats>,
    shutdown_tx: broadcast::Sender<()>,
}

impl InvalidationBus {
    /// Create a bus over `transport`
    pub fn new(transport: Arc<dyn BusTransport>, config: InvalidationConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            transport,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(AtomicInvalidationStats::default()),
            shutdown_tx,
        }
    }

    /// Register a handler for its channel type
    pub fn register(&self, handler: Arc<dyn InvalidationHandler>) {
        let channel_type = handler.channel_type();
        self.handlers
            .write()
            .entry(channel_type)
            .or_default()
            .push(handler);
        debug!(?channel_type, "Registered invalidation handler");
    }

    /// Get a snapshot of current statistics
    #[must_use]
    pub fn stats(&self) -> InvalidationStats {
        self.stats.snapshot()
    }

    /// Publish an invalidation message to all subscribers, this node included
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Bus` if the transport rejects the publish.
    pub async fn publish(&self, message: &InvalidationMessage) -> CacheResult<()> {
        let json = message.to_json()?;
        self.transport.publish(&self.config.channel, json).await?;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        debug!(
            key = %message.key,
            operation = ?message.operation,
            channel_type = ?message.channel_type,
            "Published invalidation message"
        );
        Ok(())
    }

    /// Apply a message to this node's handlers without going through the bus
    ///
    /// Used by the subscriber loop; public so that replay tooling can reuse
    /// the exact same dispatch.
    pub async fn dispatch(&self, message: &InvalidationMessage) {
        Self::dispatch_with(&self.handlers, &self.stats, message).await;
    }

    async fn dispatch_with(
        handlers: &HandlerRegistry,
        stats: &AtomicInvalidationStats,
        message: &InvalidationMessage,
    ) {
        stats.messages_received.fetch_add(1, Ordering::Relaxed);

        let registered = handlers
            .read()
            .get(&message.channel_type)
            .cloned()
            .unwrap_or_default();

        if registered.is_empty() {
            stats.messages_ignored.fetch_add(1, Ordering::Relaxed);
            debug!(
                channel_type = ?message.channel_type,
                key = %message.key,
                "No handler for channel type, ignoring"
            );
            return;
        }

        match message.operation {
            Operation::Update => stats.updates_received.fetch_add(1, Ordering::Relaxed),
            Operation::Delete => stats.deletes_received.fetch_add(1, Ordering::Relaxed),
        };

        for handler in registered {
            if let Err(e) = handler.handle(message).await {
                error!(key = %message.key, error = %e, "Invalidation handler error");
                stats.processing_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Subscribe and start the background dispatch task
    ///
    /// The first subscription is established before this returns, so messages
    /// published afterwards are seen by this node. If the stream is lost the
    /// task resubscribes after `reconnect_delay`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Bus` if the initial subscription fails.
    pub async fn start(&self) -> CacheResult<tokio::task::JoinHandle<()>> {
        let stream = self.transport.subscribe(&self.config.channel).await?;
        info!(
            channel = %self.config.channel,
            transport = self.transport.name(),
            "Subscribed to invalidation channel"
        );

        let transport = Arc::clone(&self.transport);
        let handlers = Arc::clone(&self.handlers);
        let stats = Arc::clone(&self.stats);
        let channel = self.config.channel.clone();
        let reconnect_delay = self.config.reconnect_delay;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        Ok(tokio::spawn(async move {
            let mut stream = Some(stream);

            loop {
                let current = match stream.take() {
                    Some(current) => current,
                    None => match transport.subscribe(&channel).await {
                        Ok(current) => {
                            info!(channel = %channel, "Resubscribed to invalidation channel");
                            current
                        }
                        Err(e) => {
                            error!(
                                channel = %channel,
                                error = %e,
                                "Invalidation subscribe failed. Retrying..."
                            );
                            stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                            tokio::select! {
                                () = tokio::time::sleep(reconnect_delay) => continue,
                                _ = shutdown_rx.recv() => break,
                            }
                        }
                    },
                };

                if Self::run_subscriber_loop(current, &handlers, &stats, &mut shutdown_rx).await {
                    info!("Invalidation subscriber shutting down...");
                    break;
                }

                warn!(channel = %channel, "Invalidation message stream ended. Reconnecting...");
                tokio::select! {
                    () = tokio::time::sleep(reconnect_delay) => {},
                    _ = shutdown_rx.recv() => {
                        info!("Invalidation subscriber shutting down...");
                        break;
                    }
                }
            }
        }))
    }

    /// Consume one subscription; `true` when stopped by shutdown
    async fn run_subscriber_loop(
        mut stream: BoxStream<'static, String>,
        handlers: &HandlerRegistry,
        stats: &AtomicInvalidationStats,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> bool {
        loop {
            tokio::select! {
                next = stream.next() => {
                    let Some(payload) = next else {
                        return false;
                    };
                    match InvalidationMessage::from_json(&payload) {
                        Ok(message) => Self::dispatch_with(handlers, stats, &message).await,
                        Err(e) => {
                            warn!(error = %e, "Failed to deserialize invalidation message");
                            stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                _ = shutdown_rx.recv() => return true,
            }
        }
    }

    /// Signal the subscriber to shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
