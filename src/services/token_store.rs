//! Per-account token persistence.
//!
//! The refresh-token record lives in the durable attribute store; the access
//! token lives in an evictable cache. Both are keyed by account id only.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::auth::{CachedAccessToken, RefreshTokenRecord};
use crate::services::accounts::AccountId;

/// Attribute key for the refresh token record.
pub const REFRESH_TOKEN_KEY: &str = "siwk_refresh_token";

/// Key/value attributes attached to an account (the host's user meta).
#[async_trait]
pub trait AttributeStore: Send + Sync {
    async fn get_attribute(&self, account: AccountId, key: &str) -> Result<Option<Value>>;

    async fn set_attribute(&self, account: AccountId, key: &str, value: Value) -> Result<()>;

    async fn delete_attribute(&self, account: AccountId, key: &str) -> Result<()>;
}

/// Short-lived access tokens. Entries may vanish at any time.
#[async_trait]
pub trait AccessCache: Send + Sync {
    async fn get(&self, account: AccountId) -> Result<Option<CachedAccessToken>>;

    async fn put(&self, account: AccountId, token: &CachedAccessToken) -> Result<()>;

    async fn evict(&self, account: AccountId) -> Result<()>;
}

#[derive(Clone)]
pub struct TokenStore {
    attributes: Arc<dyn AttributeStore>,
    access: Arc<dyn AccessCache>,
    early_refresh: Duration,
}

impl TokenStore {
    pub fn new(
        attributes: Arc<dyn AttributeStore>,
        access: Arc<dyn AccessCache>,
        early_refresh_seconds: i64,
    ) -> Self {
        Self {
            attributes,
            access,
            early_refresh: Duration::seconds(early_refresh_seconds.max(0)),
        }
    }

    #[instrument(skip(self))]
    pub async fn load(&self, account: AccountId) -> Result<Option<RefreshTokenRecord>> {
        let Some(value) = self
            .attributes
            .get_attribute(account, REFRESH_TOKEN_KEY)
            .await?
        else {
            return Ok(None);
        };

        match serde_json::from_value(value) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // Unreadable records cannot be redeemed; behave as if absent
                warn!(account, error = %e, "Discarding unreadable refresh token record");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, record), fields(jti = %record.jti))]
    pub async fn store(&self, account: AccountId, record: &RefreshTokenRecord) -> Result<()> {
        let value = serde_json::to_value(record).context("Failed to serialize refresh token")?;
        self.attributes
            .set_attribute(account, REFRESH_TOKEN_KEY, value)
            .await?;
        debug!(account, "Stored refresh token record");
        Ok(())
    }

    /// Remove every piece of token material held for the account.
    #[instrument(skip(self))]
    pub async fn delete(&self, account: AccountId) -> Result<()> {
        self.attributes
            .delete_attribute(account, REFRESH_TOKEN_KEY)
            .await?;
        self.access.evict(account).await?;
        debug!(account, "Deleted token material");
        Ok(())
    }

    #[instrument(skip(self, token))]
    pub async fn cache_access(&self, account: AccountId, token: &str, expires_at: i64) -> Result<()> {
        let entry = CachedAccessToken {
            token: token.to_string(),
            expires_at,
        };
        self.access.put(account, &entry).await
    }

    /// Cached access token, or `None` once it is within the early-refresh
    /// window of its expiry. Expired entries are evicted on read.
    #[instrument(skip(self))]
    pub async fn cached_access(&self, account: AccountId) -> Result<Option<String>> {
        let Some(entry) = self.access.get(account).await? else {
            return Ok(None);
        };

        if entry.is_live(Utc::now() + self.early_refresh) {
            return Ok(Some(entry.token));
        }

        debug!(account, expires_at = entry.expires_at, "Cached access token expired");
        self.access.evict(account).await?;
        Ok(None)
    }
}

/// Attribute store kept in process memory.
#[derive(Default)]
pub struct InMemoryAttributeStore {
    values: RwLock<HashMap<(AccountId, String), Value>>,
}

impl InMemoryAttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All attributes of one account, for inspection.
    pub fn attributes_of(&self, account: AccountId) -> HashMap<String, Value> {
        self.values
            .read()
            .iter()
            .filter(|((id, _), _)| *id == account)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

#[async_trait]
impl AttributeStore for InMemoryAttributeStore {
    async fn get_attribute(&self, account: AccountId, key: &str) -> Result<Option<Value>> {
        Ok(self.values.read().get(&(account, key.to_string())).cloned())
    }

    async fn set_attribute(&self, account: AccountId, key: &str, value: Value) -> Result<()> {
        self.values.write().insert((account, key.to_string()), value);
        Ok(())
    }

    async fn delete_attribute(&self, account: AccountId, key: &str) -> Result<()> {
        self.values.write().remove(&(account, key.to_string()));
        Ok(())
    }
}

/// Access cache kept in process memory. Expiry is enforced by [`TokenStore`].
#[derive(Default)]
pub struct InMemoryAccessCache {
    entries: RwLock<HashMap<AccountId, CachedAccessToken>>,
}

impl InMemoryAccessCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl AccessCache for InMemoryAccessCache {
    async fn get(&self, account: AccountId) -> Result<Option<CachedAccessToken>> {
        Ok(self.entries.read().get(&account).cloned())
    }

    async fn put(&self, account: AccountId, token: &CachedAccessToken) -> Result<()> {
        self.entries.write().insert(account, token.clone());
        Ok(())
    }

    async fn evict(&self, account: AccountId) -> Result<()> {
        self.entries.write().remove(&account);
        Ok(())
    }
}
