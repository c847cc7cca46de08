//! Best-effort invalidation of read-side projections
//!
//! Listing pages and quota summaries are cached outside this crate. Whenever a
//! listing or quota counter changes we drop the matching keys on a detached
//! task. Nothing waits on it and a failure only leaves a stale read view.

use std::fmt;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::error::{MonetizationError, MonetizationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Listing(Uuid),
    Quota(Uuid),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Listing(id) => write!(f, "listing:{}", id),
            CacheKey::Quota(user_id) => write!(f, "quota:{}", user_id),
        }
    }
}

/// Sink for cache invalidations; must never block the caller
pub trait CacheInvalidator: Send + Sync + fmt::Debug {
    fn invalidate(&self, keys: Vec<CacheKey>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCacheInvalidator;

impl CacheInvalidator for NoopCacheInvalidator {
    fn invalidate(&self, _keys: Vec<CacheKey>) {}
}

/// Deletes cache keys in Redis from a spawned task
#[derive(Clone)]
pub struct RedisCacheInvalidator {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisCacheInvalidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCacheInvalidator").finish_non_exhaustive()
    }
}

impl RedisCacheInvalidator {
    pub async fn connect(redis_url: &str) -> MonetizationResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| MonetizationError::Config(format!("invalid REDIS_URL: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| MonetizationError::Config(format!("redis connection failed: {}", e)))?;

        Ok(Self { conn })
    }
}

impl CacheInvalidator for RedisCacheInvalidator {
    fn invalidate(&self, keys: Vec<CacheKey>) {
        if keys.is_empty() {
            return;
        }

        let mut conn = self.conn.clone();
        let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();

        tokio::spawn(async move {
            if let Err(e) = conn.del::<_, ()>(&keys).await {
                tracing::warn!(
                    keys = ?keys,
                    error = %e,
                    "Cache invalidation failed; read views may be stale"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_format() {
        let id = Uuid::nil();
        assert_eq!(
            CacheKey::Listing(id).to_string(),
            "listing:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            CacheKey::Quota(id).to_string(),
            "quota:00000000-0000-0000-0000-000000000000"
        );
    }
}
