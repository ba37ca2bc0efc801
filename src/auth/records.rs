//! Persisted token material and expiry arithmetic.
//!
//! All absolute expiries are Unix timestamps in whole seconds. The provider's
//! `expires_in` is a relative number of seconds and is only ever turned into an
//! absolute expiry through [`expires_at`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::claims::{AccessClaims, IdentityClaims};

/// Metadata needed to redeem an opaque refresh token. One per account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub client_id: String,
    pub jti: String,
    pub auth_time: i64,
    #[serde(rename = "iss")]
    pub issuer: String,
    pub refresh_token: String,
}

impl RefreshTokenRecord {
    /// Assemble from validated claims plus the caller-supplied opaque token.
    pub fn from_claims(
        access: &AccessClaims,
        identity: &IdentityClaims,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            client_id: access.client_id.clone(),
            jti: identity.jti.clone(),
            auth_time: identity.auth_time,
            issuer: identity.iss.trim_end_matches('/').to_string(),
            refresh_token: refresh_token.into(),
        }
    }
}

/// Raw token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct FreshTokens {
    pub access_token: String,
    pub id_token: String,
    pub refresh_token: String,
    /// Relative lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Cached access token with its absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAccessToken {
    pub token: String,
    /// Unix timestamp (seconds)
    pub expires_at: i64,
}

impl CachedAccessToken {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now.timestamp()
    }
}

/// Absolute expiry for a relative `expires_in`. Negative lifetimes clamp to now.
pub fn expires_at(now: DateTime<Utc>, expires_in: i64) -> i64 {
    now.timestamp().saturating_add(expires_in.max(0))
}
