#![allow(dead_code)]

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use klarna_signin::auth::JwksCache;
use klarna_signin::config::{KlarnaEnvironment, ProviderConfig};
use klarna_signin::services::{
    AccountResolver, InMemoryAccessCache, InMemoryAccountStore, InMemoryAttributeStore,
    KlarnaClient, SignInOrchestrator, TokenStore,
};

pub const CLIENT_ID: &str = "klarna_test_client_1234";
pub const KID: &str = "siwk-test-key";
pub const JWKS_PATH: &str = "/eu/lp/idp/.well-known/jwks.json";
pub const TOKEN_PATH: &str = "/eu/lp/idp/oauth2/token";

const SIGNING_KEY: &[u8] = include_bytes!("../fixtures/idp_signing_key.pem");
const ROGUE_KEY: &[u8] = include_bytes!("../fixtures/rogue_signing_key.pem");

/// Public modulus of `idp_signing_key.pem`.
const SIGNING_N: &str = "xcVDXbndZEY83HNvuTkgJaqf_msDnKzGz6jrF7PB_ftskV6fawv0lw718Z-q4cISU91Tv_ncJ_jholfAApAUrnLRd8B5W9DiMrBkAnOUtSlHXeKlZnkHTnShgzjOT5eEeQXKBuvC19qJAvQ6xu7AyshSUkGhzLmuqjbNUZtOgWMK04E5Dr-fMzicAHfG3hJXBoGK7LVyLbSmWdKHezM9CJRzzBR4PlGBsZvaXbgBhYy97q2B062-7Xp6gYia-ggy1Z9AaVvQESOSfyxamy214QKybQ2WIGDeX-BMc5Y6zSz7UcpI9dAEn8Nzg8KrlYpEHbruwlQ1coNKr_tVw2YcjQ";

/// Public modulus of `rogue_signing_key.pem`.
const ROGUE_N: &str = "xkLNCrwupU3XmF1PRiDcQgA8g8F0phlQ1ZOts1buhBSJtgM6OZMOBSheuDbZAD_FLjLgRV5ianAmmRB-R4wn-SLMafG1tzSExd6jc984AWS80J8-I0WC3Fm6aIxDxY09KitDSxppGFTlrOlcc3p9zrzyiRnHPkAF340IjiQwr7v7ig0r41vMniZmAsF0D4gB5gyhfJhsIFcwFptf_xxHlkwb1aXQemGNajdA6OcFcS-dPbuJwTD-_xBN0h8_BMXO5VQrIYbyvFUom9fGbk1rT_dwV4fPte6xB4ALI2hxmKfw753TMglCixfu_VISCm_J-igpJTaYyyRPR7JSRgsh8Q";

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn jwks(modulus: &str) -> Value {
    json!({
        "keys": [{
            "kty": "RSA",
            "kid": KID,
            "use": "sig",
            "alg": "RS256",
            "n": modulus,
            "e": "AQAB"
        }]
    })
}

pub fn signing_jwks() -> Value {
    jwks(SIGNING_N)
}

pub fn rogue_jwks() -> Value {
    jwks(ROGUE_N)
}

fn sign(claims: &Value, key: &[u8]) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    let key = EncodingKey::from_rsa_pem(key).expect("test key parses");
    encode(&header, claims, &key).expect("token signs")
}

pub struct TestContext {
    pub server: MockServer,
    pub config: ProviderConfig,
    pub accounts: Arc<InMemoryAccountStore>,
    pub attributes: Arc<InMemoryAttributeStore>,
    pub access: Arc<InMemoryAccessCache>,
    pub tokens: TokenStore,
    pub orchestrator: SignInOrchestrator,
}

impl TestContext {
    pub async fn new() -> Self {
        init_logging();
        let server = MockServer::start().await;

        let config = ProviderConfig::new(KlarnaEnvironment::Playground, CLIENT_ID)
            .with_issuer(server.uri());

        let accounts = Arc::new(InMemoryAccountStore::new());
        let attributes = Arc::new(InMemoryAttributeStore::new());
        let access = Arc::new(InMemoryAccessCache::new());

        let tokens = TokenStore::new(attributes.clone(), access.clone(), 0);
        let resolver = AccountResolver::new(accounts.clone(), attributes.clone());
        let codec = JwksCache::new(&config).expect("codec builds");
        let provider = KlarnaClient::new(config.clone()).expect("client builds");
        let orchestrator = SignInOrchestrator::new(codec, provider, resolver, tokens.clone());

        Self {
            server,
            config,
            accounts,
            attributes,
            access,
            tokens,
            orchestrator,
        }
    }

    pub fn issuer(&self) -> String {
        self.config.issuer()
    }

    /// Serve the real signing key. `expected` pins the number of fetches.
    pub async fn mount_jwks(&self, expected: u64) {
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(signing_jwks()))
            .expect(expected)
            .mount(&self.server)
            .await;
    }

    pub fn identity_claims(&self, email: &str, jti: &str) -> Value {
        let now = Utc::now().timestamp();
        json!({
            "sub": "f1c2f5a4-1b7e-4c38-9f61-3e1f0e5d2a11",
            "iss": self.issuer(),
            "aud": CLIENT_ID,
            "iat": now,
            "exp": now + 300,
            "jti": jti,
            "auth_time": now - 5,
            "email": email,
            "email_verified": true,
            "given_name": "Anna",
            "family_name": "Svensson",
            "locale": "sv-SE",
            "phone": "+46701234567",
            "billing_address": {
                "street_address": "Sveavägen 46",
                "street_address_2": "",
                "city": "Stockholm",
                "region": "",
                "postal_code": "111 34",
                "country": "SE"
            }
        })
    }

    pub fn access_claims(&self) -> Value {
        let now = Utc::now().timestamp();
        json!({
            "client_id": CLIENT_ID,
            "iss": self.issuer(),
            "sub": "f1c2f5a4-1b7e-4c38-9f61-3e1f0e5d2a11",
            "scope": "offline_access profile phone email billing_address",
            "iat": now,
            "exp": now + 300
        })
    }

    pub fn id_token(&self, email: &str, jti: &str) -> String {
        sign(&self.identity_claims(email, jti), SIGNING_KEY)
    }

    pub fn access_token(&self) -> String {
        sign(&self.access_claims(), SIGNING_KEY)
    }

    pub fn signed(&self, claims: &Value) -> String {
        sign(claims, SIGNING_KEY)
    }

    pub fn rogue_signed(&self, claims: &Value) -> String {
        sign(claims, ROGUE_KEY)
    }
}
