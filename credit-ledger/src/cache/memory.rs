//! In-process activity cache on top of `moka`

use super::{entry_key, user_prefix, ActivityCache, CacheLookup};
use crate::error::CacheError;
use crate::types::{ActivityRecord, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use moka::sync::Cache;
use moka::Expiry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct CachedPage {
    records: Arc<Vec<ActivityRecord>>,
    ttl: Duration,
}

/// Expires each page after the TTL it was stored with
struct PageExpiry;

impl Expiry<String, CachedPage> for PageExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedPage,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedPage,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded in-process cache, one instance per process
pub struct MemoryActivityCache {
    pages: Cache<String, CachedPage>,
    generations: DashMap<UserId, u64>,
    prefix: String,
}

impl MemoryActivityCache {
    pub fn new(max_entries: u64, prefix: String) -> Self {
        let pages = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PageExpiry)
            .build();

        Self {
            pages,
            generations: DashMap::new(),
            prefix,
        }
    }

    fn generation(&self, user_id: UserId) -> u64 {
        self.generations.get(&user_id).map(|g| *g).unwrap_or(0)
    }
}

#[async_trait]
impl ActivityCache for MemoryActivityCache {
    async fn get(&self, user_id: UserId, signature: &str) -> Result<CacheLookup, CacheError> {
        let generation = self.generation(user_id);
        let key = entry_key(&self.prefix, user_id, generation, signature);

        Ok(match self.pages.get(&key) {
            Some(page) => CacheLookup::Hit(page.records.as_ref().clone()),
            None => CacheLookup::Miss { generation },
        })
    }

    async fn set(
        &self,
        user_id: UserId,
        signature: &str,
        generation: u64,
        records: &[ActivityRecord],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if self.generation(user_id) != generation {
            debug!(user_id = %user_id, "Skipping cache populate for invalidated generation");
            return Ok(());
        }

        let key = entry_key(&self.prefix, user_id, generation, signature);
        self.pages.insert(
            key,
            CachedPage {
                records: Arc::new(records.to_vec()),
                ttl,
            },
        );

        Ok(())
    }

    async fn invalidate_user(&self, user_id: UserId) -> Result<(), CacheError> {
        *self.generations.entry(user_id).or_insert(0) += 1;

        let prefix = user_prefix(&self.prefix, user_id);
        let stale: Vec<Arc<String>> = self
            .pages
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key)
            .collect();

        for key in &stale {
            self.pages.invalidate(key.as_str());
        }

        debug!(user_id = %user_id, removed = stale.len(), "Invalidated cached activity");
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.pages.invalidate_all();
        self.generations.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GrantId, TransactionId};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn record(user_id: UserId, id: i64) -> ActivityRecord {
        ActivityRecord {
            transaction_id: TransactionId(id),
            user_id,
            grant_id: GrantId(1),
            is_credit: true,
            amount: dec!(5),
            created_at: Utc::now(),
        }
    }

    fn cache() -> MemoryActivityCache {
        MemoryActivityCache::new(100, "activity".to_string())
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = cache();
        let user = UserId::random();

        let generation = match cache.get(user, "q").await.unwrap() {
            CacheLookup::Miss { generation } => generation,
            hit => panic!("expected miss, got {:?}", hit),
        };

        let records = vec![record(user, 1), record(user, 2)];
        cache
            .set(user, "q", generation, &records, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.get(user, "q").await.unwrap(), CacheLookup::Hit(records));

        // Different signature is a separate entry
        assert!(matches!(
            cache.get(user, "other").await.unwrap(),
            CacheLookup::Miss { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalidate_removes_only_that_user() {
        let cache = cache();
        let user = UserId::random();
        let other = UserId::random();

        for u in [user, other] {
            cache
                .set(u, "q", 0, &[record(u, 1)], Duration::from_secs(60))
                .await
                .unwrap();
        }

        cache.invalidate_user(user).await.unwrap();

        assert!(matches!(
            cache.get(user, "q").await.unwrap(),
            CacheLookup::Miss { generation: 1 }
        ));
        assert!(matches!(
            cache.get(other, "q").await.unwrap(),
            CacheLookup::Hit(_)
        ));
    }

    #[tokio::test]
    async fn test_populate_after_invalidation_is_dropped() {
        let cache = cache();
        let user = UserId::random();

        // Reader misses at generation 0, then a mutation invalidates
        cache.invalidate_user(user).await.unwrap();
        cache
            .set(user, "q", 0, &[record(user, 1)], Duration::from_secs(60))
            .await
            .unwrap();

        assert!(matches!(
            cache.get(user, "q").await.unwrap(),
            CacheLookup::Miss { generation: 1 }
        ));
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = cache();
        let user = UserId::random();

        cache
            .set(user, "q", 0, &[record(user, 1)], Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(matches!(
            cache.get(user, "q").await.unwrap(),
            CacheLookup::Miss { .. }
        ));
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = cache();
        let user = UserId::random();

        cache
            .set(user, "q", 0, &[record(user, 1)], Duration::from_secs(60))
            .await
            .unwrap();
        cache.clear().await.unwrap();

        assert!(matches!(
            cache.get(user, "q").await.unwrap(),
            CacheLookup::Miss { .. }
        ));
    }
}
