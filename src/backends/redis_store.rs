//! Redis Backends - Shared Store and Pub/Sub Transport
//!
//! `RedisStore` keeps values, nil flags and lock leases in Redis through a
//! `ConnectionManager` (automatic reconnection). `RedisPubSub` carries
//! invalidation messages over Redis Pub/Sub.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info, warn};

use crate::error::{CacheError, CacheResult};
use crate::traits::{BusTransport, SharedStore};

/// Delete KEYS[1] only when it holds ARGV[1]
const COMPARE_AND_DELETE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis shared store with `ConnectionManager` for automatic reconnection
pub struct RedisStore {
    conn_manager: ConnectionManager,
    compare_and_delete: redis::Script,
}

impl RedisStore {
    /// Connect to Redis at `redis_url` and verify the connection with `PING`
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Transport` if the client cannot be created or the
    /// connection fails.
    pub async fn with_url(redis_url: &str) -> CacheResult<Self> {
        info!(redis_url = %redis_url, "Initializing Redis shared store with ConnectionManager");

        let client =
            Client::open(redis_url).map_err(|e| CacheError::transport("connect", redis_url, e))?;

        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::transport("connect", redis_url, e))?;

        let mut conn = conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::transport("ping", redis_url, e))?;

        info!(redis_url = %redis_url, "Redis shared store connected");

        Ok(Self {
            conn_manager,
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE_SCRIPT),
        })
    }

    /// Connection handle shared with the Pub/Sub publisher
    #[must_use]
    pub fn connection(&self) -> ConnectionManager {
        self.conn_manager.clone()
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn_manager.clone();
        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(|e| CacheError::transport("get", key, e))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::transport("set", key, e))?;
        debug!(key = %key, ttl_ms = ttl_millis(ttl), "[Redis] Stored key with TTL");
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn_manager.clone();
        // SET key value NX PX ttl -> "OK" when written, nil otherwise
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::transport("set_if_absent", key, e))?;
        Ok(reply.is_some())
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> CacheResult<bool> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CacheError::transport("delete_if_eq", key, e))?;
        Ok(removed > 0)
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn_manager.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        match pong {
            Ok(pong) => pong == "PONG",
            Err(e) => {
                warn!(error = %e, "[Redis] Health check failed");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}

/// Redis Pub/Sub transport for invalidation messages
pub struct RedisPubSub {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisPubSub {
    /// Create a transport that publishes over `publisher` and opens dedicated
    /// subscription connections from `redis_url`
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Bus` if the Redis client cannot be created.
    pub fn new(redis_url: &str, publisher: ConnectionManager) -> CacheResult<Self> {
        let client = Client::open(redis_url).map_err(|e| CacheError::bus(redis_url, e))?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl BusTransport for RedisPubSub {
    async fn publish(&self, channel: &str, payload: String) -> CacheResult<()> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| CacheError::bus(channel, e))?;
        debug!(channel = %channel, receivers, "[Redis] Published invalidation message");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> CacheResult<BoxStream<'static, String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| CacheError::bus(channel, e))?;

        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| CacheError::bus(channel, e))?;

        info!(channel = %channel, "Subscribed to Redis invalidation channel");

        let channel = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Failed to get message payload");
                    None
                }
            };
            futures_util::future::ready(payload)
        });

        Ok(stream.boxed())
    }

    fn name(&self) -> &'static str {
        "Redis Pub/Sub"
    }
}
