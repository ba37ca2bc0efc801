//! Mapping verified Klarna identities onto local storefront accounts.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::auth::claims::{non_empty, IdentityClaims};
use crate::error::{SignInError, TokenError};
use crate::services::token_store::AttributeStore;

pub type AccountId = i64;

pub const CUSTOMER_ROLE: &str = "customer";
pub const ACCOUNT_DESCRIPTION: &str = "Sign in with Klarna";

/// Local storefront account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: AccountId,
    pub login: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: String,
    pub locale: Option<String>,
    pub role: String,
}

/// Fields for a new account
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub login: String,
    pub email: String,
    /// Random value that no password check will ever match
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: String,
    pub locale: Option<String>,
    pub role: String,
    pub description: String,
}

#[derive(Debug, Error)]
pub enum CreateAccountError {
    #[error("login or email already taken: {0}")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The host's account storage.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_by_login(&self, login: &str) -> Result<Option<Account>>;

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>>;

    async fn create(&self, account: NewAccount) -> Result<AccountId, CreateAccountError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub account: Account,
    pub created: bool,
}

#[derive(Clone)]
pub struct AccountResolver {
    accounts: Arc<dyn AccountStore>,
    attributes: Arc<dyn AttributeStore>,
}

impl AccountResolver {
    pub fn new(accounts: Arc<dyn AccountStore>, attributes: Arc<dyn AttributeStore>) -> Self {
        Self {
            accounts,
            attributes,
        }
    }

    /// Find-or-create, then copy non-empty profile fields onto the account.
    pub async fn resolve(&self, claims: &IdentityClaims) -> Result<Resolved, SignInError> {
        if let Some(account) = self.find_existing(claims).await? {
            self.sync_profile(account.id, claims).await?;
            return Ok(Resolved {
                account,
                created: false,
            });
        }

        let account = self.create(claims).await?;
        Ok(Resolved {
            account,
            created: true,
        })
    }

    /// Existing account by exact login, falling back to exact email.
    #[instrument(skip(self, claims), fields(jti = %claims.jti))]
    pub async fn find_existing(&self, claims: &IdentityClaims) -> Result<Option<Account>, SignInError> {
        let (login, email) = identity_keys(claims)?;

        if let Some(account) = self.accounts.find_by_login(&login).await? {
            if sanitize_email(&account.email) == email {
                debug!(account = account.id, "Matched account by login");
                return Ok(Some(account));
            }
            warn!(
                account = account.id,
                "Login matches an account with a different email, not using it"
            );
        }

        let found = self.accounts.find_by_email(&email).await?;
        if let Some(account) = &found {
            debug!(account = account.id, "Matched account by email");
        }
        Ok(found)
    }

    /// Create an account for the identity. A uniqueness collision is reported,
    /// never retried.
    #[instrument(skip(self, claims), fields(jti = %claims.jti))]
    pub async fn create(&self, claims: &IdentityClaims) -> Result<Account, SignInError> {
        let new_account = new_account(claims)?;
        let template = new_account.clone();

        let id = self.accounts.create(new_account).await.map_err(|e| match e {
            CreateAccountError::Conflict(detail) => SignInError::AccountCreationFailed(detail),
            CreateAccountError::Other(e) => SignInError::Storage(e),
        })?;

        info!(account = id, "Created account for Klarna identity");
        self.sync_profile(id, claims).await?;

        Ok(Account {
            id,
            login: template.login,
            email: template.email,
            first_name: template.first_name,
            last_name: template.last_name,
            display_name: template.display_name,
            locale: template.locale,
            role: template.role,
        })
    }

    /// Write the profile attributes the claims carry. Empty values are left
    /// out entirely so they never erase known data.
    pub async fn sync_profile(&self, account: AccountId, claims: &IdentityClaims) -> Result<(), SignInError> {
        for (key, value) in profile_attributes(claims) {
            self.attributes
                .set_attribute(account, key, Value::String(value))
                .await?;
        }
        Ok(())
    }
}

/// Login and email the identity maps to.
pub fn identity_keys(claims: &IdentityClaims) -> Result<(String, String), SignInError> {
    let email = claims
        .email()
        .map(sanitize_email)
        .filter(|e| e.contains('@'))
        .ok_or_else(|| TokenError::Malformed("identity token carries no usable email".into()))?;

    let login = sanitize_login(&email)
        .ok_or_else(|| TokenError::Malformed("email cannot be used as a login".into()))?;
    Ok((login, email))
}

/// Lowercased, trimmed email.
pub fn sanitize_email(email: &str) -> String {
    email
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_lowercase()
}

/// Characters besides letters and digits allowed in the local part of an
/// address, plus the separators of the domain.
const LOGIN_SYMBOLS: &str = "!#$%&'*+-/=?^_`{|}~.@";

/// Account handle for an email: the lowercased address itself. `None` when it
/// holds a character a handle cannot carry; nothing is ever dropped, so two
/// distinct addresses never share a handle.
pub fn sanitize_login(raw: &str) -> Option<String> {
    let login = raw.trim().to_lowercase();
    let representable = !login.is_empty()
        && login
            .chars()
            .all(|c| c.is_alphanumeric() || LOGIN_SYMBOLS.contains(c));
    representable.then_some(login)
}

fn clean_text(value: Option<&str>) -> Option<String> {
    non_empty(value)
        .map(|v| {
            v.chars()
                .filter(|c| !c.is_control() && !matches!(c, '<' | '>'))
                .collect::<String>()
                .trim()
                .to_string()
        })
        .filter(|v| !v.is_empty())
}

fn new_account(claims: &IdentityClaims) -> Result<NewAccount, SignInError> {
    let (login, email) = identity_keys(claims)?;
    let first_name = clean_text(claims.given_name.as_deref());
    let last_name = clean_text(claims.family_name.as_deref());

    let display_name = match (&first_name, &last_name) {
        (Some(first), Some(last)) => format!("{} {}", first, last),
        (Some(name), None) | (None, Some(name)) => name.clone(),
        (None, None) => login.clone(),
    };

    Ok(NewAccount {
        login,
        email,
        password: format!("!{}", Uuid::new_v4().simple()),
        first_name,
        last_name,
        display_name,
        locale: clean_text(claims.locale.as_deref()),
        role: CUSTOMER_ROLE.to_string(),
        description: ACCOUNT_DESCRIPTION.to_string(),
    })
}

/// Billing and shipping attributes derived from the claims, empties omitted.
pub fn profile_attributes(claims: &IdentityClaims) -> Vec<(&'static str, String)> {
    let address = claims.billing();
    let email = claims.email().map(sanitize_email);
    let first_name = clean_text(claims.given_name.as_deref());
    let last_name = clean_text(claims.family_name.as_deref());
    let phone = clean_text(claims.phone.as_deref());
    let city = clean_text(address.city.as_deref());
    let state = clean_text(address.region.as_deref());
    let country = clean_text(address.country.as_deref());
    let postcode = clean_text(address.postal_code.as_deref());
    let address_1 = clean_text(address.street_address.as_deref());
    let address_2 = clean_text(address.street_address_2.as_deref());

    let fields: [(&'static str, &'static str, Option<String>); 10] = [
        ("billing_first_name", "shipping_first_name", first_name),
        ("billing_last_name", "shipping_last_name", last_name),
        ("billing_city", "shipping_city", city),
        ("billing_state", "shipping_state", state),
        ("billing_country", "shipping_country", country),
        ("billing_postcode", "shipping_postcode", postcode),
        ("billing_address_1", "shipping_address_1", address_1),
        ("billing_address_2", "shipping_address_2", address_2),
        ("billing_phone", "shipping_phone", phone),
        ("billing_email", "shipping_email", email),
    ];

    let mut attributes = Vec::new();
    for (billing, shipping, value) in fields {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            attributes.push((billing, value.clone()));
            attributes.push((shipping, value));
        }
    }
    attributes
}

/// Account store kept in process memory.
pub struct InMemoryAccountStore {
    accounts: RwLock<Vec<Account>>,
}

impl Default for InMemoryAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(Vec::new()),
        }
    }

    /// Seed an account with a fixed id.
    pub fn insert(&self, account: Account) {
        self.accounts.write().push(account);
    }

    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.read().is_empty()
    }

    pub fn get(&self, id: AccountId) -> Option<Account> {
        self.accounts.read().iter().find(|a| a.id == id).cloned()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn find_by_login(&self, login: &str) -> Result<Option<Account>> {
        Ok(self.accounts.read().iter().find(|a| a.login == login).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        Ok(self
            .accounts
            .read()
            .iter()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn create(&self, account: NewAccount) -> Result<AccountId, CreateAccountError> {
        let mut accounts = self.accounts.write();
        if accounts
            .iter()
            .any(|a| a.login == account.login || a.email.eq_ignore_ascii_case(&account.email))
        {
            return Err(CreateAccountError::Conflict(account.login));
        }

        let id = accounts.iter().map(|a| a.id).max().unwrap_or(0) + 1;
        accounts.push(Account {
            id,
            login: account.login,
            email: account.email,
            first_name: account.first_name,
            last_name: account.last_name,
            display_name: account.display_name,
            locale: account.locale,
            role: account.role,
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::BillingAddress;
    use crate::services::token_store::InMemoryAttributeStore;

    fn claims(email: &str, city: Option<&str>) -> IdentityClaims {
        IdentityClaims {
            sub: Some("klarna-customer".into()),
            iss: "https://login.playground.klarna.com".into(),
            iat: None,
            exp: i64::MAX,
            jti: "jti".into(),
            auth_time: 0,
            email: Some(email.into()),
            email_verified: Some(true),
            given_name: Some("Anna".into()),
            family_name: Some("Svensson".into()),
            locale: Some("sv-SE".into()),
            phone: Some("+46701234567".into()),
            billing_address: Some(BillingAddress {
                street_address: Some("Sveavägen 46".into()),
                street_address_2: Some(String::new()),
                city: city.map(str::to_string),
                region: None,
                postal_code: Some("111 34".into()),
                country: Some("SE".into()),
            }),
        }
    }

    fn resolver() -> (AccountResolver, Arc<InMemoryAccountStore>, Arc<InMemoryAttributeStore>) {
        let accounts = Arc::new(InMemoryAccountStore::new());
        let attributes = Arc::new(InMemoryAttributeStore::new());
        (
            AccountResolver::new(accounts.clone(), attributes.clone()),
            accounts,
            attributes,
        )
    }

    #[test]
    fn login_keeps_every_character_of_the_email() {
        assert_eq!(
            sanitize_login("Anna.Svensson+shop@Example.com").as_deref(),
            Some("anna.svensson+shop@example.com")
        );
        assert_eq!(sanitize_login("Jörg@example.de").as_deref(), Some("jörg@example.de"));
        assert_eq!(sanitize_login("a b@x.se"), None);
        assert_eq!(sanitize_login("<a>@x.se"), None);
        assert_eq!(sanitize_email(" Anna@Example.COM "), "anna@example.com");
    }

    #[test]
    fn distinct_emails_never_share_a_login() {
        for (a, b) in [("a+b@example.com", "ab@example.com"), ("jörg@example.com", "jrg@example.com")] {
            let (login_a, _) = identity_keys(&claims(a, None)).unwrap();
            let (login_b, _) = identity_keys(&claims(b, None)).unwrap();
            assert_ne!(login_a, login_b);
        }
    }

    #[tokio::test]
    async fn plus_address_does_not_resolve_to_plain_address() {
        let (resolver, accounts, _) = resolver();
        let victim = resolver.resolve(&claims("ab@example.com", None)).await.unwrap();
        let other = resolver.resolve(&claims("a+b@example.com", None)).await.unwrap();
        let umlaut = resolver.resolve(&claims("jörg@example.com", None)).await.unwrap();
        let plain = resolver.resolve(&claims("jrg@example.com", None)).await.unwrap();

        assert!(other.created);
        assert!(plain.created);
        assert_ne!(victim.account.id, other.account.id);
        assert_ne!(umlaut.account.id, plain.account.id);
        assert_eq!(accounts.len(), 4);
    }

    #[tokio::test]
    async fn login_match_with_other_email_is_ignored() {
        let (resolver, accounts, _) = resolver();
        accounts.insert(Account {
            id: 5,
            login: "anna@example.com".into(),
            email: "someone-else@example.com".into(),
            first_name: None,
            last_name: None,
            display_name: "anna".into(),
            locale: None,
            role: CUSTOMER_ROLE.into(),
        });

        let found = resolver
            .find_existing(&claims("anna@example.com", None))
            .await
            .unwrap();
        assert_eq!(found, None);

        let err = resolver.create(&claims("anna@example.com", None)).await.unwrap_err();
        assert!(matches!(err, SignInError::AccountCreationFailed(_)));
    }

    #[test]
    fn claims_without_email_cannot_be_mapped() {
        let mut c = claims("x@y.se", None);
        c.email = Some("   ".into());
        assert!(matches!(identity_keys(&c), Err(SignInError::InvalidToken(_))));
    }

    #[test]
    fn empty_fields_are_omitted_from_profile() {
        let attrs = profile_attributes(&claims("anna@example.com", None));
        let keys: Vec<_> = attrs.iter().map(|(k, _)| *k).collect();

        assert!(keys.contains(&"billing_postcode"));
        assert!(keys.contains(&"shipping_address_1"));
        assert!(!keys.contains(&"billing_city"));
        assert!(!keys.contains(&"billing_address_2"));
        assert!(!keys.contains(&"billing_state"));
        assert!(attrs.iter().all(|(_, v)| !v.is_empty()));
    }

    #[tokio::test]
    async fn resolve_is_idempotent() {
        let (resolver, accounts, _) = resolver();

        let first = resolver.resolve(&claims("anna@example.com", None)).await.unwrap();
        let second = resolver.resolve(&claims("anna@example.com", None)).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.account.id, second.account.id);
        assert_eq!(accounts.len(), 1);
    }

    #[tokio::test]
    async fn new_account_is_a_customer_without_usable_password() {
        let (resolver, _, _) = resolver();
        let account = resolver.create(&claims("Anna@Example.com", None)).await.unwrap();

        assert_eq!(account.email, "anna@example.com");
        assert_eq!(account.login, "anna@example.com");
        assert_eq!(account.role, CUSTOMER_ROLE);
        assert_eq!(account.display_name, "Anna Svensson");

        let template = new_account(&claims("anna@example.com", None)).unwrap();
        assert!(template.password.starts_with('!'));
        assert_eq!(template.description, ACCOUNT_DESCRIPTION);
    }

    #[tokio::test]
    async fn empty_city_never_erases_stored_city() {
        let (resolver, _, attributes) = resolver();

        let id = resolver
            .resolve(&claims("anna@example.com", Some("Stockholm")))
            .await
            .unwrap()
            .account
            .id;
        resolver
            .resolve(&claims("anna@example.com", Some("")))
            .await
            .unwrap();

        let stored = attributes.attributes_of(id);
        assert_eq!(stored["billing_city"], Value::String("Stockholm".into()));
        assert_eq!(stored["shipping_city"], Value::String("Stockholm".into()));
    }

    #[tokio::test]
    async fn email_match_is_used_when_login_differs() {
        let (resolver, accounts, _) = resolver();
        accounts.insert(Account {
            id: 42,
            login: "anna".into(),
            email: "anna@example.com".into(),
            first_name: None,
            last_name: None,
            display_name: "anna".into(),
            locale: None,
            role: CUSTOMER_ROLE.into(),
        });

        let found = resolver
            .find_existing(&claims("ANNA@example.com", None))
            .await
            .unwrap();
        assert_eq!(found.map(|a| a.id), Some(42));
    }

    #[tokio::test]
    async fn uniqueness_collision_is_reported() {
        let (resolver, _, _) = resolver();
        resolver.create(&claims("anna@example.com", None)).await.unwrap();

        let err = resolver
            .create(&claims("anna@example.com", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SignInError::AccountCreationFailed(_)));
    }
}
