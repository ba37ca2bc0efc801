//! Redis-backed access-token cache.
//!
//! Entries are written with a native TTL matching the token's absolute expiry,
//! so Redis drops them on its own; [`crate::services::TokenStore`] still checks
//! the expiry on read.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, instrument, warn};

use crate::auth::CachedAccessToken;
use crate::services::accounts::AccountId;
use crate::services::token_store::AccessCache;

/// Redis cache client with connection pooling.
#[derive(Clone)]
pub struct RedisAccessCache {
    conn: ConnectionManager,
}

impl RedisAccessCache {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        tracing::info!("Redis access token cache connected");

        Ok(Self { conn })
    }

    /// Check if Redis is healthy.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis health check failed")?;
        Ok(())
    }
}

#[async_trait]
impl AccessCache for RedisAccessCache {
    #[instrument(skip(self), fields(cache_hit))]
    async fn get(&self, account: AccountId) -> Result<Option<CachedAccessToken>> {
        let mut conn = self.conn.clone();
        let key = keys::access_token(account);

        let data: Option<String> = conn.get(&key).await.context("Redis get failed")?;
        let Some(data) = data else {
            debug!(key = %key, "Cache miss");
            tracing::Span::current().record("cache_hit", false);
            return Ok(None);
        };

        match serde_json::from_str(&data) {
            Ok(entry) => {
                tracing::Span::current().record("cache_hit", true);
                Ok(Some(entry))
            }
            Err(e) => {
                // A cache entry is never worth failing a request over
                warn!(key = %key, error = %e, "Failed to deserialize cached access token");
                tracing::Span::current().record("cache_hit", false);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, token))]
    async fn put(&self, account: AccountId, token: &CachedAccessToken) -> Result<()> {
        let ttl = token.expires_at - Utc::now().timestamp();
        if ttl <= 0 {
            return self.evict(account).await;
        }

        let mut conn = self.conn.clone();
        let key = keys::access_token(account);
        let data = serde_json::to_string(token).context("Failed to serialize access token")?;

        conn.set_ex::<_, _, ()>(&key, data, ttl as u64)
            .await
            .context("Failed to cache access token")?;

        debug!(key = %key, ttl_secs = ttl, "Cached access token");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn evict(&self, account: AccountId) -> Result<()> {
        let mut conn = self.conn.clone();
        let deleted: i32 = conn
            .del(keys::access_token(account))
            .await
            .context("Failed to delete cache key")?;

        debug!(account, deleted = deleted > 0, "Cache delete");
        Ok(())
    }
}

/// Cache key builders for consistent key formats.
pub mod keys {
    use crate::services::accounts::AccountId;

    /// Access token cache key
    pub fn access_token(account: AccountId) -> String {
        format!("siwk:access_token:account:{}", account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_scoped_per_account() {
        assert_eq!(keys::access_token(7), "siwk:access_token:account:7");
        assert_ne!(keys::access_token(7), keys::access_token(70));
    }
}
