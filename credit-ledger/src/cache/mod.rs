//! Read-through cache for activity history
//!
//! Entries are keyed by user, per-user generation, and query signature:
//!
//! ```text
//! {prefix}:{user_id}:{generation}:{signature}
//! ```
//!
//! `invalidate_user` bumps the user's generation before deleting the user's
//! entries. A reader that missed before an invalidation populates under the
//! old generation, which no later reader looks up, so a stale page can never
//! be served after a committed mutation.

pub mod memory;
pub mod redis;

use crate::config::{CacheBackend, CacheConfig};
use crate::error::CacheError;
use crate::types::{ActivityRecord, UserId};
use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use self::memory::MemoryActivityCache;
pub use self::redis::RedisActivityCache;

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(Vec<ActivityRecord>),

    /// Pass `generation` back to [`ActivityCache::set`] when populating
    Miss { generation: u64 },
}

/// Key-value cache with TTL and per-user prefix deletion
#[async_trait]
pub trait ActivityCache: Send + Sync {
    async fn get(&self, user_id: UserId, signature: &str) -> Result<CacheLookup, CacheError>;

    /// Store a page read at `generation`. Dropped if the user was invalidated
    /// since.
    async fn set(
        &self,
        user_id: UserId,
        signature: &str,
        generation: u64,
        records: &[ActivityRecord],
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Delete every cached view of the user
    async fn invalidate_user(&self, user_id: UserId) -> Result<(), CacheError>;

    /// Delete everything this cache owns
    async fn clear(&self) -> Result<(), CacheError>;
}

pub type SharedActivityCache = Arc<dyn ActivityCache>;

pub(crate) fn entry_key(prefix: &str, user_id: UserId, generation: u64, signature: &str) -> String {
    format!("{}:{}:{}:{}", prefix, user_id, generation, signature)
}

pub(crate) fn user_prefix(prefix: &str, user_id: UserId) -> String {
    format!("{}:{}:", prefix, user_id)
}

lazy_static! {
    static ref INSTALLED: RwLock<Option<SharedActivityCache>> = RwLock::new(None);
}

/// Install the process-wide cache. Fails if one is already installed.
pub fn install(cache: SharedActivityCache) -> Result<(), CacheError> {
    let mut slot = INSTALLED.write();
    if slot.is_some() {
        return Err(CacheError::AlreadyInstalled);
    }

    *slot = Some(cache);
    Ok(())
}

/// The process-wide cache, if installed
pub fn installed() -> Option<SharedActivityCache> {
    INSTALLED.read().clone()
}

/// Remove the process-wide cache and drop its entries
pub async fn teardown() -> Result<(), CacheError> {
    let cache = INSTALLED.write().take();

    if let Some(cache) = cache {
        cache.clear().await?;
        info!("Activity cache torn down");
    }

    Ok(())
}

/// Build the configured cache backend
pub async fn from_config(config: &CacheConfig) -> Result<SharedActivityCache, CacheError> {
    let cache: SharedActivityCache = match config.backend {
        CacheBackend::Memory => Arc::new(MemoryActivityCache::new(
            config.max_entries,
            config.key_prefix.clone(),
        )),
        CacheBackend::Redis => {
            Arc::new(RedisActivityCache::connect(&config.redis_url, config.key_prefix.clone()).await?)
        }
    };

    info!(backend = ?config.backend, ttl_secs = config.ttl_secs, "Activity cache ready");
    Ok(cache)
}
