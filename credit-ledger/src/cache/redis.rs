//! Redis activity cache
//!
//! Pages are stored as JSON under `SET EX`. Per-user generations live under
//! `{prefix}:epoch:{user_id}`, outside every user's entry prefix.

use super::{entry_key, user_prefix, ActivityCache, CacheLookup};
use crate::error::CacheError;
use crate::types::{ActivityRecord, UserId};
use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Keys fetched per SCAN round trip
const SCAN_COUNT: usize = 256;

/// Keys deleted per DEL
const DELETE_CHUNK: usize = 128;

#[derive(Clone)]
pub struct RedisActivityCache {
    redis: ConnectionManager,
    prefix: String,
}

impl RedisActivityCache {
    pub async fn connect(url: &str, prefix: String) -> Result<Self, CacheError> {
        let client = ::redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;

        Ok(Self::new(redis, prefix))
    }

    pub fn new(redis: ConnectionManager, prefix: String) -> Self {
        Self { redis, prefix }
    }

    fn epoch_key(&self, user_id: UserId) -> String {
        format!("{}:epoch:{}", self.prefix, user_id)
    }

    async fn generation(&self, user_id: UserId) -> Result<u64, CacheError> {
        let generation: Option<u64> = self.redis.clone().get(self.epoch_key(user_id)).await?;
        Ok(generation.unwrap_or(0))
    }

    /// Delete every key matching `pattern`, returning how many were removed
    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut conn = self.redis.clone();
        let mut deleted = 0u64;
        let mut cursor = 0u64;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;

            for chunk in keys.chunks(DELETE_CHUNK) {
                let removed: u64 = conn.del(chunk).await?;
                deleted = deleted.saturating_add(removed);
            }

            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        Ok(deleted)
    }
}

#[async_trait]
impl ActivityCache for RedisActivityCache {
    async fn get(&self, user_id: UserId, signature: &str) -> Result<CacheLookup, CacheError> {
        let generation = self.generation(user_id).await?;
        let key = entry_key(&self.prefix, user_id, generation, signature);

        match self.redis.clone().get::<_, Option<String>>(&key).await? {
            Some(json) => match serde_json::from_str(&json) {
                Ok(records) => Ok(CacheLookup::Hit(records)),
                Err(e) => {
                    // Unreadable entry behaves like a miss and is overwritten on populate
                    warn!(key = %key, error = %e, "Discarding undecodable cached activity");
                    Ok(CacheLookup::Miss { generation })
                }
            },
            None => Ok(CacheLookup::Miss { generation }),
        }
    }

    async fn set(
        &self,
        user_id: UserId,
        signature: &str,
        generation: u64,
        records: &[ActivityRecord],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if self.generation(user_id).await? != generation {
            debug!(user_id = %user_id, "Skipping cache populate for invalidated generation");
            return Ok(());
        }

        let key = entry_key(&self.prefix, user_id, generation, signature);
        let json = serde_json::to_string(records)?;
        let seconds = ttl.as_secs().max(1);

        let _: () = self.redis.clone().set_ex(&key, json, seconds).await?;
        Ok(())
    }

    async fn invalidate_user(&self, user_id: UserId) -> Result<(), CacheError> {
        let _: u64 = self.redis.clone().incr(self.epoch_key(user_id), 1u64).await?;

        let pattern = format!("{}*", user_prefix(&self.prefix, user_id));
        let removed = self.delete_matching(&pattern).await?;

        debug!(user_id = %user_id, removed, "Invalidated cached activity");
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let removed = self.delete_matching(&format!("{}:*", self.prefix)).await?;
        debug!(removed, "Cleared activity cache");
        Ok(())
    }
}
