use anyhow::{Context, Result};
use serde::Serialize;
use std::env;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "prod" | "production" => Self::Prod,
            "staging" => Self::Staging,
            _ => Self::Dev,
        }
    }

    pub fn is_dev(&self) -> bool {
        matches!(self, Self::Dev)
    }
}

/// Which Klarna identity environment the storefront talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KlarnaEnvironment {
    Playground,
    Production,
}

impl KlarnaEnvironment {
    /// Anything other than an explicit "production" stays on the playground.
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" | "live" => Self::Production,
            _ => Self::Playground,
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            Self::Playground => "https://login.playground.klarna.com",
            Self::Production => "https://login.klarna.com",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Playground => "playground",
            Self::Production => "production",
        }
    }
}

/// Regional identity endpoint prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Eu,
    Na,
}

impl Region {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "na" | "us" => Self::Na,
            _ => Self::Eu,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eu => "eu",
            Self::Na => "na",
        }
    }
}

pub const DEFAULT_SCOPE: &str = "offline_access profile phone email billing_address";

/// Provider configuration handed to every component at construction.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub environment: KlarnaEnvironment,
    /// Overrides the environment's issuer host (tests, proxies).
    pub issuer_override: Option<String>,
    pub client_id: String,
    pub region: Region,
    pub market: Option<String>,
    pub locale: Option<String>,
    pub scope: String,
    pub http_timeout: Duration,
    /// `expires_in` used when the inbound event carries none.
    pub default_expires_in: i64,
    /// Cached access tokens are dropped this many seconds before they expire.
    pub early_refresh_seconds: i64,
}

impl ProviderConfig {
    pub fn new(environment: KlarnaEnvironment, client_id: impl Into<String>) -> Self {
        Self {
            environment,
            issuer_override: None,
            client_id: client_id.into(),
            region: Region::Eu,
            market: None,
            locale: None,
            scope: DEFAULT_SCOPE.to_string(),
            http_timeout: Duration::from_secs(10),
            default_expires_in: 299,
            early_refresh_seconds: 30,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer_override = Some(issuer.into());
        self
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    /// Base issuer URL without a trailing slash.
    pub fn issuer(&self) -> String {
        self.issuer_override
            .as_deref()
            .unwrap_or(self.environment.base_url())
            .trim_end_matches('/')
            .to_string()
    }

    pub fn jwks_url(&self) -> Result<Url> {
        Url::parse(&format!(
            "{}/{}/lp/idp/.well-known/jwks.json",
            self.issuer(),
            self.region.as_str()
        ))
        .context("Invalid JWKS URL")
    }

    /// Token endpoint for an issuer taken from a stored refresh-token record.
    pub fn token_url(&self, issuer: &str) -> Result<Url> {
        Url::parse(&format!(
            "{}/{}/lp/idp/oauth2/token",
            issuer.trim_end_matches('/'),
            self.region.as_str()
        ))
        .context("Invalid token endpoint URL")
    }

    /// Attributes the front-end library needs to render the sign-in widget.
    pub fn widget_attributes(&self) -> WidgetAttributes {
        WidgetAttributes {
            client_id: self.client_id.clone(),
            environment: self.environment.as_str().to_string(),
            market: self.market.clone(),
            locale: self.locale.clone(),
            scope: self.scope.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WidgetAttributes {
    pub client_id: String,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    pub scope: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub env: Environment,
    pub server_addr: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis
    pub redis_url: String,

    // Klarna identity provider
    pub provider: ProviderConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let env = Environment::from_str(&env::var("ENV").unwrap_or_else(|_| "dev".to_string()));
        let server_addr = env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        // Database
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        // Redis
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://redis:6379/0".to_string());

        // Klarna
        let environment = KlarnaEnvironment::from_str(
            &env::var("KLARNA_ENVIRONMENT").unwrap_or_else(|_| "playground".to_string()),
        );
        let client_id = env::var("KLARNA_CLIENT_ID").context("KLARNA_CLIENT_ID must be set")?;
        let region = Region::from_str(&env::var("KLARNA_REGION").unwrap_or_else(|_| "eu".into()));

        let mut provider = ProviderConfig::new(environment, client_id).with_region(region);
        provider.issuer_override = optional("KLARNA_ISSUER_URL");
        provider.market = optional("KLARNA_MARKET");
        provider.locale = optional("KLARNA_LOCALE");
        if let Some(scope) = optional("KLARNA_SCOPE") {
            provider.scope = scope;
        }
        provider.http_timeout = Duration::from_secs(
            env::var("KLARNA_HTTP_TIMEOUT_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
        );
        provider.default_expires_in = env::var("SIWK_ACCESS_TOKEN_TTL_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(299);
        provider.early_refresh_seconds = env::var("SIWK_EARLY_REFRESH_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Ok(Settings {
            env,
            server_addr,
            database_url,
            database_max_connections,
            redis_url,
            provider,
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}
