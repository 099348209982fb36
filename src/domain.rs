//! Domain Refresh Facades
//!
//! Thin per-domain wrappers over [`CacheManager`]: each one owns a key prefix
//! and an authoritative source, and exposes `get(id)` / `refresh(id)`.
//!
//! # Example
//!
//! ```rust,ignore
//! struct OrgByUser { db: Db }
//!
//! #[async_trait]
//! impl DomainSource for OrgByUser {
//!     type Value = Org;
//!     fn prefix(&self) -> &'static str { prefixes::ORG_BY_USER_ID }
//!     async fn fetch(&self, user_id: &str) -> Result<Option<Org>, BoxError> {
//!         self.db.org_of_user(user_id).await.map_err(Into::into)
//!     }
//! }
//!
//! let orgs = DomainCache::new(system.cache_manager(), OrgByUser { db });
//! let org = orgs.get("42").await?; // key "org:userId:42"
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::cache_manager::CacheManager;
use crate::error::{BoxError, CacheResult};

/// Well-known key prefixes
pub mod prefixes {
    /// Organization of a user
    pub const ORG_BY_USER_ID: &str = "org:userId:";
    /// Menu by menu code
    pub const MENU_BY_CODE: &str = "menu:code:";
    /// Roles of a user
    pub const USER_ROLES: &str = "user:roles:";
    /// Permissions of a user
    pub const USER_PERMISSIONS: &str = "user:perms:";
    /// Menus visible to a user
    pub const USER_MENUS: &str = "user:menus:";
}

/// Authoritative lookup for one kind of cached entity
#[async_trait]
pub trait DomainSource: Send + Sync {
    type Value: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Key prefix, including the trailing separator
    fn prefix(&self) -> &'static str;

    /// `Ok(None)` means confirmed not found; `Err` only for transport or auth
    /// failures
    async fn fetch(&self, id: &str) -> Result<Option<Self::Value>, BoxError>;
}

/// Something that can reset the cached state for an id
#[async_trait]
pub trait Refreshable: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    async fn refresh(&self, id: &str) -> CacheResult<()>;
}

/// Cached view of one [`DomainSource`]
pub struct DomainCache<S> {
    manager: Arc<CacheManager>,
    source: Arc<S>,
}

impl<S: DomainSource + 'static> DomainCache<S> {
    pub fn new(manager: Arc<CacheManager>, source: S) -> Self {
        Self {
            manager,
            source: Arc::new(source),
        }
    }

    /// Cache key for an id
    #[must_use]
    pub fn key(&self, id: &str) -> String {
        format!("{}{}", self.source.prefix(), id)
    }

    /// Read-through lookup; an empty id is absent without touching any tier
    ///
    /// # Errors
    ///
    /// Propagates `SourceTransport` when the source fails.
    pub async fn get(&self, id: &str) -> CacheResult<Option<S::Value>> {
        if id.is_empty() {
            return Ok(None);
        }
        let source = Arc::clone(&self.source);
        let owned_id = id.to_string();
        self.manager
            .get_or_load(&self.key(id), move || async move { source.fetch(&owned_id).await })
            .await
    }

    /// Reset the cached state for an id; an empty id is a no-op
    ///
    /// # Errors
    ///
    /// See [`CacheManager::refresh`].
    pub async fn refresh(&self, id: &str) -> CacheResult<()> {
        if id.is_empty() {
            return Ok(());
        }
        self.manager.refresh(&self.key(id)).await
    }
}

#[async_trait]
impl<S: DomainSource + 'static> Refreshable for DomainCache<S> {
    fn name(&self) -> &'static str {
        self.source.prefix()
    }

    async fn refresh(&self, id: &str) -> CacheResult<()> {
        DomainCache::refresh(self, id).await
    }
}

/// Refreshes every per-user cache for a user
///
/// All caches are attempted even if an earlier one fails; the first failure is
/// returned afterwards.
pub struct UserCacheRefresher {
    caches: Vec<Arc<dyn Refreshable>>,
}

impl UserCacheRefresher {
    pub fn new(caches: Vec<Arc<dyn Refreshable>>) -> Self {
        Self { caches }
    }

    /// Refresh roles, permissions, menus (whatever was registered) for a user
    ///
    /// # Errors
    ///
    /// Returns the first refresh error after all caches were attempted.
    pub async fn refresh_user(&self, user_id: &str) -> CacheResult<()> {
        let mut first_error = None;
        for cache in &self.caches {
            if let Err(e) = cache.refresh(user_id).await {
                warn!(
                    user_id = %user_id,
                    cache = cache.name(),
                    error = %e,
                    "User cache refresh failed"
                );
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                debug!(user_id = %user_id, caches = self.caches.len(), "Refreshed user caches");
                Ok(())
            }
        }
    }
}
