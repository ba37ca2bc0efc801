//! Token decoding and JWKS-backed verification for Klarna tokens

use anyhow::{Context, Result};
use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use jsonwebtoken::{decode, decode_header, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

use crate::config::ProviderConfig;
use crate::error::TokenError;

/// Payload segments show up both with and without padding.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const SUPPORTED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// JWKS response structure
#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

/// Individual JWK key
#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<String>,
}

type KeySet = Arc<HashMap<Option<String>, DecodingKey>>;

/// Provider signing keys, fetched lazily and dropped whenever a signature
/// fails to verify so rotated keys are picked up on the next call.
#[derive(Clone)]
pub struct JwksCache {
    keys: Arc<RwLock<Option<KeySet>>>,
    client: Client,
    jwks_url: Url,
}

impl JwksCache {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(client, config.jwks_url()?))
    }

    pub fn with_client(client: Client, jwks_url: Url) -> Self {
        Self {
            keys: Arc::new(RwLock::new(None)),
            client,
            jwks_url,
        }
    }

    /// Read the payload of a token without checking its signature.
    ///
    /// Only the second dot-delimited segment is looked at; callers must not
    /// trust the result unless the same token went through [`Self::validate`].
    pub fn decode<T: DeserializeOwned>(token: &str) -> Result<T, TokenError> {
        let mut segments = token.split('.');
        let payload = match (segments.next(), segments.next()) {
            (Some(_), Some(payload)) => payload,
            _ => return Err(TokenError::Malformed("expected at least two segments".into())),
        };

        let bytes = PAYLOAD_ENGINE
            .decode(payload.trim())
            .map_err(|e| TokenError::Malformed(format!("payload is not base64url: {}", e)))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| TokenError::Malformed(format!("payload is not a claim set: {}", e)))
    }

    /// Verify a token's signature and expiry, then return its claims.
    pub async fn validate<T: DeserializeOwned>(&self, token: &str) -> Result<T, TokenError> {
        self.validate_inner(token, None).await
    }

    /// As [`Self::validate`], and additionally require `aud` to name `audience`.
    pub async fn validate_for<T: DeserializeOwned>(
        &self,
        token: &str,
        audience: &str,
    ) -> Result<T, TokenError> {
        self.validate_inner(token, Some(audience)).await
    }

    async fn validate_inner<T: DeserializeOwned>(
        &self,
        token: &str,
        audience: Option<&str>,
    ) -> Result<T, TokenError> {
        let header = decode_header(token).map_err(TokenError::Header)?;
        if !SUPPORTED_ALGORITHMS.contains(&header.alg) {
            return Err(TokenError::UnsupportedAlgorithm(header.alg));
        }

        let keys = match self.cached() {
            Some(keys) => keys,
            None => self.refresh_keys().await?,
        };

        let kid = header.kid.as_deref();
        match verify(&keys, kid, header.alg, audience, token) {
            Ok(claims) => Ok(claims),
            Err(err) if is_key_failure(&err) => {
                tracing::warn!(error = %err, "Token did not verify against cached JWKS, refetching");
                self.invalidate();

                let keys = self.refresh_keys().await?;
                verify(&keys, kid, header.alg, audience, token).map_err(|err| {
                    if is_key_failure(&err) {
                        self.invalidate();
                    }
                    err
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Drop the cached key set; the next validation refetches it.
    pub fn invalidate(&self) {
        *self.keys.write() = None;
    }

    /// Pre-warm the cache by fetching keys
    pub async fn warm_cache(&self) -> Result<(), TokenError> {
        self.refresh_keys().await.map(|_| ())
    }

    fn cached(&self) -> Option<KeySet> {
        self.keys.read().clone()
    }

    async fn refresh_keys(&self) -> Result<KeySet, TokenError> {
        tracing::debug!("Fetching JWKS from {}", self.jwks_url);

        let response = self
            .client
            .get(self.jwks_url.clone())
            .send()
            .await
            .map_err(|e| TokenError::JwksFetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TokenError::JwksFetch(format!(
                "JWKS fetch failed with status: {}",
                response.status()
            )));
        }

        let jwks: JwksResponse = response
            .json()
            .await
            .map_err(|e| TokenError::JwksFetch(format!("Failed to parse JWKS: {}", e)))?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            match decoding_key(&jwk) {
                Some(Ok(key)) => {
                    tracing::debug!(kid = ?jwk.kid, "Cached JWKS key");
                    keys.insert(jwk.kid.clone(), key);
                }
                Some(Err(e)) => {
                    tracing::warn!(kid = ?jwk.kid, error = %e, "Failed to parse JWK");
                }
                None => continue,
            }
        }

        tracing::info!("JWKS cache refreshed with {} keys", keys.len());

        let keys = Arc::new(keys);
        *self.keys.write() = Some(keys.clone());
        Ok(keys)
    }
}

fn decoding_key(jwk: &Jwk) -> Option<jsonwebtoken::errors::Result<DecodingKey>> {
    match (jwk.kty.as_str(), &jwk.n, &jwk.e, &jwk.x, &jwk.y) {
        ("RSA", Some(n), Some(e), _, _) => Some(DecodingKey::from_rsa_components(n, e)),
        ("EC", _, _, Some(x), Some(y)) => Some(DecodingKey::from_ec_components(x, y)),
        _ => None,
    }
}

fn verify<T: DeserializeOwned>(
    keys: &HashMap<Option<String>, DecodingKey>,
    kid: Option<&str>,
    alg: Algorithm,
    audience: Option<&str>,
    token: &str,
) -> Result<T, TokenError> {
    let key = match kid {
        Some(kid) => keys.get(&Some(kid.to_string())),
        // Without a kid we only accept an unambiguous key set
        None if keys.len() == 1 => keys.values().next(),
        None => None,
    }
    .ok_or_else(|| TokenError::KeyNotFound(kid.map(str::to_string)))?;

    let mut validation = Validation::new(alg);
    validation.validate_exp = true;
    validation.validate_nbf = true;
    match audience {
        Some(audience) => {
            validation.set_audience(&[audience]);
            validation.set_required_spec_claims(&["exp", "aud"]);
        }
        None => {
            validation.validate_aud = false;
            validation.set_required_spec_claims(&["exp"]);
        }
    }

    decode::<T>(token, key, &validation)
        .map(|data| data.claims)
        .map_err(TokenError::Verification)
}

/// Failures a fresher key set could fix, as opposed to expired or malformed claims.
fn is_key_failure(err: &TokenError) -> bool {
    match err {
        TokenError::KeyNotFound(_) => true,
        TokenError::Verification(e) => matches!(
            e.kind(),
            ErrorKind::InvalidSignature
                | ErrorKind::InvalidKeyFormat
                | ErrorKind::InvalidRsaKey(_)
                | ErrorKind::InvalidEcdsaKey
                | ErrorKind::InvalidAlgorithm
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::claims::IdentityClaims;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use serde_json::json;

    fn unsigned(payload: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{}.{}.signature", header, body)
    }

    #[test]
    fn decode_reads_payload_segment() {
        let token = unsigned(&json!({
            "iss": "https://login.playground.klarna.com",
            "exp": 1_900_000_000,
            "jti": "abc",
            "auth_time": 1_700_000_000,
            "email": "anna@example.com",
            "billing_address": { "city": "Stockholm" }
        }));

        let claims: IdentityClaims = JwksCache::decode(&token).unwrap();
        assert_eq!(claims.jti, "abc");
        assert_eq!(claims.email(), Some("anna@example.com"));
        assert_eq!(claims.billing().city.as_deref(), Some("Stockholm"));
    }

    #[test]
    fn decode_accepts_two_segments_and_padding() {
        let payload = STANDARD.encode(r#"{"client_id":"c","exp":1}"#);
        let token = format!("header.{}", payload.replace('+', "-").replace('/', "_"));
        let claims: serde_json::Value = JwksCache::decode(&token).unwrap();
        assert_eq!(claims["client_id"], "c");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            JwksCache::decode::<serde_json::Value>("no-dots-here"),
            Err(TokenError::Malformed(_))
        ));
        assert!(matches!(
            JwksCache::decode::<serde_json::Value>("a.!!!.c"),
            Err(TokenError::Malformed(_))
        ));
        let not_json = format!("a.{}.c", URL_SAFE_NO_PAD.encode("plain text"));
        assert!(matches!(
            JwksCache::decode::<serde_json::Value>(&not_json),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn kid_less_tokens_need_single_key() {
        let keys: HashMap<Option<String>, DecodingKey> = HashMap::new();
        let err = verify::<serde_json::Value>(&keys, None, Algorithm::RS256, None, "a.b.c").unwrap_err();
        assert!(matches!(err, TokenError::KeyNotFound(None)));
        assert!(is_key_failure(&err));
    }
}
