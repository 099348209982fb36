//! Backend Implementations
//!
//! Concrete implementations of the capability traits in [`crate::traits`].
//!
//! # Available Backends
//!
//! ## Distributed (default)
//! - **Redis** - `RedisStore` (values, nil flags, lock leases) and
//!   `RedisPubSub` (invalidation transport) (feature: `redis`)
//!
//! ## In-Process
//! - **Memory** - `MemoryStore` and `MemoryBus`; same semantics, single
//!   process. Used by the integration tests to run several nodes side by side.
//!
//! # Usage
//!
//! ```rust,no_run
//! use coherent_cache::backends::{MemoryBus, MemoryStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let bus = MemoryBus::new(1024);
//! ```

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory::{MemoryBus, MemoryStore};

#[cfg(feature = "redis")]
pub use redis_store::{RedisPubSub, RedisStore};
