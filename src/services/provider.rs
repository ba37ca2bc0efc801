//! Client for the Klarna identity provider's OAuth2 token endpoint.

use anyhow::Context;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::auth::{FreshTokens, RefreshTokenRecord};
use crate::config::ProviderConfig;
use crate::error::SignInError;

/// Client for the identity provider.
#[derive(Clone)]
pub struct KlarnaClient {
    client: Client,
    config: ProviderConfig,
}

/// OAuth2 error body. Klarna does not always send one.
#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
    client_id: &'a str,
    grant_type: &'static str,
}

impl KlarnaClient {
    pub fn new(config: ProviderConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        tracing::info!(
            issuer = %config.issuer(),
            region = config.region.as_str(),
            "Klarna client initialized"
        );

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// A record can only be redeemed against the issuer and client it was minted for.
    pub fn check_record(&self, record: &RefreshTokenRecord) -> Result<(), SignInError> {
        let issuer = self.config.issuer();
        if record.issuer.trim_end_matches('/') != issuer || record.client_id != self.config.client_id
        {
            return Err(SignInError::EnvironmentMismatch {
                issuer: record.issuer.clone(),
                client_id: record.client_id.clone(),
            });
        }
        Ok(())
    }

    /// Exchange a stored refresh token for a fresh token set.
    ///
    /// The returned tokens are unverified; the id token must go through the
    /// codec before any claim in it is used.
    #[instrument(skip(self, record), fields(jti = %record.jti))]
    pub async fn redeem(&self, record: &RefreshTokenRecord) -> Result<FreshTokens, SignInError> {
        self.check_record(record)?;

        let url = self
            .config
            .token_url(&record.issuer)
            .map_err(|e| SignInError::Network(e.to_string()))?;

        debug!(url = %url, "Redeeming refresh token");

        let response = self
            .client
            .post(url)
            .form(&RefreshGrant {
                refresh_token: &record.refresh_token,
                client_id: &record.client_id,
                grant_type: "refresh_token",
            })
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Token endpoint request failed");
                SignInError::Network(e.to_string())
            })?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.json::<OAuthErrorResponse>().await.ok();
            warn!(
                status = %status,
                error = body.as_ref().and_then(|b| b.error.as_deref()),
                description = body.as_ref().and_then(|b| b.error_description.as_deref()),
                "Identity provider rejected refresh token"
            );
            return Err(SignInError::ProviderRejected {
                status: status.as_u16(),
            });
        }

        response.json::<FreshTokens>().await.map_err(|e| {
            error!(error = %e, "Failed to parse token endpoint response");
            SignInError::Network(format!("Invalid token endpoint response: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KlarnaEnvironment;

    fn record(issuer: &str, client_id: &str) -> RefreshTokenRecord {
        RefreshTokenRecord {
            client_id: client_id.into(),
            jti: "jti".into(),
            auth_time: 0,
            issuer: issuer.into(),
            refresh_token: "opaque".into(),
        }
    }

    #[test]
    fn records_from_other_environments_are_rejected() {
        let client =
            KlarnaClient::new(ProviderConfig::new(KlarnaEnvironment::Production, "client-1")).unwrap();

        assert!(client
            .check_record(&record("https://login.klarna.com/", "client-1"))
            .is_ok());
        assert!(matches!(
            client.check_record(&record("https://login.playground.klarna.com", "client-1")),
            Err(SignInError::EnvironmentMismatch { .. })
        ));
        assert!(matches!(
            client.check_record(&record("https://login.klarna.com", "client-2")),
            Err(SignInError::EnvironmentMismatch { .. })
        ));
    }
}
