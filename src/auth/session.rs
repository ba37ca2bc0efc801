use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderName},
};
use parking_lot::Mutex;

use crate::error::ApiError;
use crate::services::accounts::AccountId;

/// Header the host framework uses to tell us who the browser session belongs to.
pub const SESSION_ACCOUNT_HEADER: HeaderName = HeaderName::from_static("x-session-account");

/// The host's notion of "who is signed in" for the current request.
#[async_trait]
pub trait HostSession: Send + Sync {
    /// `None` for guests.
    fn current_account(&self) -> Option<AccountId>;

    /// Make `account` the authenticated identity of this session.
    async fn authenticate(&self, account: AccountId) -> anyhow::Result<()>;
}

/// Session that records the authentication request instead of setting a
/// cookie; the host applies it after reading the response.
#[derive(Debug, Default)]
pub struct RequestSession {
    current: Option<AccountId>,
    authenticated: Mutex<Option<AccountId>>,
}

impl RequestSession {
    pub fn guest() -> Self {
        Self::default()
    }

    pub fn signed_in(account: AccountId) -> Self {
        Self {
            current: Some(account),
            authenticated: Mutex::new(None),
        }
    }

    /// Account the orchestrator asked to sign in, if any.
    pub fn authenticated(&self) -> Option<AccountId> {
        *self.authenticated.lock()
    }
}

#[async_trait]
impl HostSession for RequestSession {
    fn current_account(&self) -> Option<AccountId> {
        self.current
    }

    async fn authenticate(&self, account: AccountId) -> anyhow::Result<()> {
        *self.authenticated.lock() = Some(account);
        Ok(())
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestSession {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(&SESSION_ACCOUNT_HEADER) else {
            return Ok(Self::guest());
        };

        let value = value
            .to_str()
            .map_err(|_| ApiError::BadRequest("Invalid session header".to_string()))?
            .trim();

        // The host sends 0 or nothing for guests
        match value.parse::<AccountId>() {
            Ok(0) => Ok(Self::guest()),
            Ok(id) if id > 0 => Ok(Self::signed_in(id)),
            _ => Err(ApiError::BadRequest("Invalid session header".to_string())),
        }
    }
}
