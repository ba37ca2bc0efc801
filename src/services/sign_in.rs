//! Sign-in orchestration: validate the browser's token set, link it to a local
//! account and keep the account's Klarna tokens fresh afterwards.
//!
//! Each call is a self-contained request/response sequence. Nothing is held
//! between calls beyond what the token store and account storage persist.

use chrono::Utc;
use serde::{de, Deserialize, Deserializer, Serialize};
use std::fmt;
use tracing::{debug, info, instrument, warn};

use crate::auth::records::expires_at;
use crate::auth::{AccessClaims, HostSession, IdentityClaims, JwksCache, RefreshTokenRecord};
use crate::error::SignInError;
use crate::services::accounts::{AccountId, AccountResolver};
use crate::services::provider::KlarnaClient;
use crate::services::token_store::TokenStore;

/// Token set delivered by the front-end after the shopper signed in.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignInEvent {
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds
    #[serde(default, deserialize_with = "seconds")]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub source: Option<SignInSource>,
}

/// Front-ends post `expires_in` as a number or as a form string.
fn seconds<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(seconds)) => Ok(Some(seconds)),
        Some(Raw::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Raw::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| de::Error::custom("expires_in must be a whole number of seconds")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignInSource {
    Popup,
    Redirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignInOutcome {
    /// Session was already authenticated; tokens attached to that account.
    AlreadyLinked,
    /// The matched account is already the session's identity. Never produced
    /// by [`SignInOrchestrator::sign_in`]: a signed-in session is always
    /// reported as `AlreadyLinked`.
    AlreadySignedIn,
    ExistingUserSignedIn,
    NewUserCreated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignInResult {
    pub outcome: SignInOutcome,
    pub account_id: AccountId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInState {
    Idle,
    Validating,
    Resolving,
    Linked(SignInOutcome),
    Failed(&'static str),
}

impl fmt::Display for SignInState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Validating => f.write_str("validating"),
            Self::Resolving => f.write_str("resolving"),
            Self::Linked(outcome) => write!(f, "linked({:?})", outcome),
            Self::Failed(code) => write!(f, "failed({})", code),
        }
    }
}

/// Per-invocation state tracker; terminal states are never left.
#[derive(Debug)]
struct Machine {
    state: SignInState,
}

impl Machine {
    fn new() -> Self {
        Self {
            state: SignInState::Idle,
        }
    }

    fn advance(&mut self, next: SignInState) {
        debug_assert!(
            !matches!(self.state, SignInState::Linked(_) | SignInState::Failed(_)),
            "left terminal state {}",
            self.state
        );
        debug!(from = %self.state, to = %next, "Sign-in transition");
        self.state = next;
    }
}

/// Validated inbound fields.
struct Credentials {
    id_token: String,
    access_token: String,
    refresh_token: String,
    expires_in: Option<i64>,
}

impl SignInEvent {
    fn credentials(self) -> Result<Credentials, SignInError> {
        fn present(value: Option<String>) -> Option<String> {
            value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        }

        let id_token = present(self.id_token);
        let access_token = present(self.access_token);
        let refresh_token = present(self.refresh_token);

        let missing: Vec<&str> = [
            ("id_token", id_token.is_none()),
            ("access_token", access_token.is_none()),
            ("refresh_token", refresh_token.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, missing)| missing.then_some(name))
        .collect();

        match (id_token, access_token, refresh_token) {
            (Some(id_token), Some(access_token), Some(refresh_token)) => Ok(Credentials {
                id_token,
                access_token,
                refresh_token,
                expires_in: self.expires_in,
            }),
            _ => Err(SignInError::MissingParameters(missing.join(", "))),
        }
    }
}

#[derive(Clone)]
pub struct SignInOrchestrator {
    codec: JwksCache,
    provider: KlarnaClient,
    accounts: AccountResolver,
    tokens: TokenStore,
}

impl SignInOrchestrator {
    pub fn new(
        codec: JwksCache,
        provider: KlarnaClient,
        accounts: AccountResolver,
        tokens: TokenStore,
    ) -> Self {
        Self {
            codec,
            provider,
            accounts,
            tokens,
        }
    }

    pub fn provider(&self) -> &KlarnaClient {
        &self.provider
    }

    /// Handle a sign-in event for the given host session.
    pub async fn sign_in(
        &self,
        event: SignInEvent,
        session: &dyn HostSession,
    ) -> Result<SignInResult, SignInError> {
        let mut machine = Machine::new();
        let source = event.source;

        let result = self.run(&mut machine, event, session).await;
        match &result {
            Ok(result) => {
                machine.advance(SignInState::Linked(result.outcome));
                info!(
                    outcome = ?result.outcome,
                    account = result.account_id,
                    source = ?source,
                    "Sign in with Klarna completed"
                );
            }
            Err(e) => {
                machine.advance(SignInState::Failed(e.error_code()));
            }
        }
        result
    }

    async fn run(
        &self,
        machine: &mut Machine,
        event: SignInEvent,
        session: &dyn HostSession,
    ) -> Result<SignInResult, SignInError> {
        let credentials = event.credentials()?;

        machine.advance(SignInState::Validating);
        let client_id = &self.provider.config().client_id;
        let identity: IdentityClaims = self
            .codec
            .validate_for(&credentials.id_token, client_id)
            .await?;
        let access: AccessClaims = self.codec.validate(&credentials.access_token).await?;

        let record = RefreshTokenRecord::from_claims(&access, &identity, credentials.refresh_token);
        // Tokens minted for another client or issuer could never be redeemed here
        self.provider.check_record(&record)?;
        let expires_in = credentials
            .expires_in
            .unwrap_or(self.provider.config().default_expires_in);
        let access_expires_at = expires_at(Utc::now(), expires_in);

        machine.advance(SignInState::Resolving);

        // Signed-in shoppers keep their account (and cart); only tokens are attached
        if let Some(current) = session.current_account() {
            self.link(current, &record, &credentials.access_token, access_expires_at)
                .await?;
            return Ok(SignInResult {
                outcome: SignInOutcome::AlreadyLinked,
                account_id: current,
            });
        }

        if let Some(account) = self.accounts.find_existing(&identity).await? {
            // Email ownership is asserted by the identity token alone
            warn!(
                account = account.id,
                jti = %identity.jti,
                "Signing guest in to existing account matched by Klarna identity"
            );
            self.accounts.sync_profile(account.id, &identity).await?;
            self.link(account.id, &record, &credentials.access_token, access_expires_at)
                .await?;
            session.authenticate(account.id).await?;

            return Ok(SignInResult {
                outcome: SignInOutcome::ExistingUserSignedIn,
                account_id: account.id,
            });
        }

        let account = self.accounts.create(&identity).await?;
        self.link(account.id, &record, &credentials.access_token, access_expires_at)
            .await?;
        session.authenticate(account.id).await?;

        Ok(SignInResult {
            outcome: SignInOutcome::NewUserCreated,
            account_id: account.id,
        })
    }

    async fn link(
        &self,
        account: AccountId,
        record: &RefreshTokenRecord,
        access_token: &str,
        access_expires_at: i64,
    ) -> Result<(), SignInError> {
        self.tokens.store(account, record).await?;
        self.tokens
            .cache_access(account, access_token, access_expires_at)
            .await?;
        Ok(())
    }

    /// A usable access token for the account, redeeming the stored refresh
    /// token when the cached one is gone. `None` for guests and for accounts
    /// that never signed in with Klarna.
    #[instrument(skip(self))]
    pub async fn access_token(&self, account: Option<AccountId>) -> Result<Option<String>, SignInError> {
        let Some(account) = account else {
            return Ok(None);
        };

        if let Some(token) = self.tokens.cached_access(account).await? {
            return Ok(Some(token));
        }

        self.refresh(account).await
    }

    /// Redeem the stored refresh token regardless of the access-token cache.
    #[instrument(skip(self))]
    pub async fn refresh(&self, account: AccountId) -> Result<Option<String>, SignInError> {
        let Some(record) = self.tokens.load(account).await? else {
            return Ok(None);
        };

        let fresh = match self.provider.redeem(&record).await {
            Ok(fresh) => fresh,
            Err(e @ SignInError::EnvironmentMismatch { .. }) => {
                warn!(account, error = %e, "Purging refresh token from another environment");
                self.tokens.delete(account).await?;
                return Err(e);
            }
            Err(e @ SignInError::ProviderRejected { .. }) => {
                self.purge_if_unchanged(account, &record).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        // A redemption response is not trusted until its tokens verify
        let identity: IdentityClaims = self
            .codec
            .validate_for(&fresh.id_token, &self.provider.config().client_id)
            .await?;
        let access: AccessClaims = self.codec.validate(&fresh.access_token).await?;

        let next = RefreshTokenRecord::from_claims(&access, &identity, fresh.refresh_token);
        let expires_in = fresh
            .expires_in
            .unwrap_or(self.provider.config().default_expires_in);

        self.link(account, &next, &fresh.access_token, expires_at(Utc::now(), expires_in))
            .await?;
        info!(account, jti = %next.jti, "Refreshed Klarna tokens");

        Ok(Some(fresh.access_token))
    }

    /// The provider rejected `redeemed`. Purge it unless a concurrent
    /// redemption already replaced it with a newer record.
    async fn purge_if_unchanged(
        &self,
        account: AccountId,
        redeemed: &RefreshTokenRecord,
    ) -> Result<(), SignInError> {
        match self.tokens.load(account).await? {
            Some(current) if current.refresh_token != redeemed.refresh_token => {
                debug!(account, "Refresh token already rotated by another request");
            }
            _ => {
                warn!(account, jti = %redeemed.jti, "Refresh token rejected, purging");
                self.tokens.delete(account).await?;
            }
        }
        Ok(())
    }

    /// Whether the host should offer the sign-in button to this session.
    pub async fn needs_sign_in(&self, account: Option<AccountId>) -> Result<bool, SignInError> {
        match account {
            None => Ok(true),
            Some(account) => Ok(self.tokens.load(account).await?.is_none()),
        }
    }

    /// Forget all Klarna token material for the account.
    pub async fn purge(&self, account: AccountId) -> Result<(), SignInError> {
        self.tokens.delete(account).await?;
        Ok(())
    }
}
