//! Cache configuration
//!
//! Every component has its own config struct with sensible defaults.
//! `CacheConfig::from_env()` overlays environment variables on top of the
//! defaults; `REDIS_URL` falls back to `redis://127.0.0.1:6379`.

use std::time::Duration;

use tracing::warn;

use crate::error::{CacheError, CacheResult};

/// Configuration for the process-local cache
#[derive(Debug, Clone, Copy)]
pub struct LocalCacheConfig {
    /// Max number of entries held before capacity eviction
    pub max_capacity: u64,
    /// TTL applied when a caller or message does not carry one
    pub default_ttl: Duration,
    /// Entries untouched for this long are evicted
    pub time_to_idle: Duration,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            default_ttl: Duration::from_secs(300),
            time_to_idle: Duration::from_secs(120),
        }
    }
}

/// Configuration for the shared (distributed) cache
#[derive(Debug, Clone)]
pub struct SharedCacheConfig {
    /// Application-wide key prefix, keeps unrelated subsystems apart
    pub key_prefix: String,
    /// TTL of positive entries
    pub default_ttl: Duration,
}

impl Default for SharedCacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "app".to_string(),
            default_ttl: Duration::from_secs(1800),
        }
    }
}

/// Configuration for negative caching
#[derive(Debug, Clone, Copy)]
pub struct NilFlagConfig {
    /// Lifetime of a nil flag; should not exceed the positive TTL
    pub ttl: Duration,
}

impl Default for NilFlagConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
        }
    }
}

/// Configuration for the distributed lock
#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// Lock lease; must exceed the worst-case recompute latency
    pub ttl: Duration,
    /// How long `lock()` waits before giving up
    pub acquire_timeout: Duration,
    /// Base delay between acquisition attempts (jittered)
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(3),
            retry_interval: Duration::from_millis(50),
        }
    }
}

/// Configuration for cache invalidation
#[derive(Debug, Clone)]
pub struct InvalidationConfig {
    /// Pub/Sub channel carrying invalidation messages
    pub channel: String,
    /// Delay before the subscriber reconnects after losing its stream
    pub reconnect_delay: Duration,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            channel: "cache:invalidate".to_string(),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// What the task runner does when its queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectionPolicy {
    /// Refuse the task, log it and report `false` to the submitter
    #[default]
    Reject,
    /// Run the task outside the queue on the submitter's runtime, up to
    /// `overflow_limit` such tasks at once; beyond that the task is refused
    CallerRuns,
}

/// Configuration for the background task runner
#[derive(Debug, Clone, Copy)]
pub struct TaskRunnerConfig {
    /// Number of worker tasks
    pub workers: usize,
    /// Bounded queue length
    pub queue_capacity: usize,
    /// Saturation policy
    pub rejection_policy: RejectionPolicy,
    /// Tasks allowed to run concurrently outside the queue under `CallerRuns`
    pub overflow_limit: usize,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            rejection_policy: RejectionPolicy::Reject,
            overflow_limit: 4,
        }
    }
}

/// Top-level configuration for a cache node
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Redis connection string used by the default backends
    pub redis_url: String,
    /// Identity of this node; generated when absent
    pub node_id: Option<String>,
    pub local: LocalCacheConfig,
    pub shared: SharedCacheConfig,
    pub nil_flag: NilFlagConfig,
    pub lock: LockConfig,
    pub invalidation: InvalidationConfig,
    pub runner: TaskRunnerConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            node_id: None,
            local: LocalCacheConfig::default(),
            shared: SharedCacheConfig::default(),
            nil_flag: NilFlagConfig::default(),
            lock: LockConfig::default(),
            invalidation: InvalidationConfig::default(),
            runner: TaskRunnerConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Build a configuration from defaults overlaid with environment variables
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Config` if a numeric variable does not parse.
    pub fn from_env() -> CacheResult<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(prefix) = std::env::var("CACHE_KEY_PREFIX") {
            config.shared.key_prefix = prefix;
        }
        if let Ok(node_id) = std::env::var("CACHE_NODE_ID") {
            config.node_id = Some(node_id);
        }
        if let Some(secs) = env_u64("CACHE_NIL_FLAG_TTL_SECS")? {
            config.nil_flag.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("CACHE_SHARED_TTL_SECS")? {
            config.shared.default_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("CACHE_LOCAL_TTL_SECS")? {
            config.local.default_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("CACHE_LOCK_TTL_SECS")? {
            config.lock.ttl = Duration::from_secs(secs);
        }
        if let Some(workers) = env_u64("CACHE_TASK_WORKERS")? {
            config.runner.workers = usize::try_from(workers)
                .map_err(|e| CacheError::Config(format!("CACHE_TASK_WORKERS: {e}")))?;
        }
        if let Some(capacity) = env_u64("CACHE_TASK_QUEUE")? {
            config.runner.queue_capacity = usize::try_from(capacity)
                .map_err(|e| CacheError::Config(format!("CACHE_TASK_QUEUE: {e}")))?;
        }
        if let Some(limit) = env_u64("CACHE_TASK_OVERFLOW")? {
            config.runner.overflow_limit = usize::try_from(limit)
                .map_err(|e| CacheError::Config(format!("CACHE_TASK_OVERFLOW: {e}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values that would break the core
    ///
    /// A nil-flag TTL longer than the positive TTL is allowed but logged.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Config` describing the first invalid value.
    pub fn validate(&self) -> CacheResult<()> {
        if self.local.max_capacity == 0 {
            return Err(CacheError::Config("local.max_capacity must be > 0".into()));
        }
        if self.local.default_ttl.is_zero() {
            return Err(CacheError::Config("local.default_ttl must be > 0".into()));
        }
        if self.shared.default_ttl.is_zero() {
            return Err(CacheError::Config("shared.default_ttl must be > 0".into()));
        }
        if self.shared.key_prefix.is_empty() {
            return Err(CacheError::Config("shared.key_prefix must not be empty".into()));
        }
        if self.nil_flag.ttl.is_zero() {
            return Err(CacheError::Config("nil_flag.ttl must be > 0".into()));
        }
        if self.lock.ttl <= self.lock.retry_interval {
            return Err(CacheError::Config(
                "lock.ttl must exceed lock.retry_interval".into(),
            ));
        }
        if self.runner.workers == 0 {
            return Err(CacheError::Config("runner.workers must be > 0".into()));
        }
        if self.runner.queue_capacity == 0 {
            return Err(CacheError::Config("runner.queue_capacity must be > 0".into()));
        }
        if self.nil_flag.ttl > self.shared.default_ttl {
            warn!(
                nil_flag_ttl = ?self.nil_flag.ttl,
                shared_ttl = ?self.shared.default_ttl,
                "Nil-flag TTL exceeds positive TTL; recreated entities may stay masked"
            );
        }
        Ok(())
    }
}

fn env_u64(name: &str) -> CacheResult<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| CacheError::Config(format!("{name}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
