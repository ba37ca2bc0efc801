use serde::{Deserialize, Serialize};

/// Payload of a Klarna identity token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Subject (Klarna customer id)
    #[serde(default)]
    pub sub: Option<String>,

    /// Issuer base URL
    pub iss: String,

    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: Option<i64>,

    /// Expiration (Unix timestamp)
    pub exp: i64,

    /// Unique token id
    pub jti: String,

    /// Time the shopper authenticated (Unix timestamp)
    #[serde(default)]
    pub auth_time: i64,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub email_verified: Option<bool>,

    #[serde(default)]
    pub given_name: Option<String>,

    #[serde(default)]
    pub family_name: Option<String>,

    #[serde(default)]
    pub locale: Option<String>,

    #[serde(default)]
    pub phone: Option<String>,

    #[serde(default)]
    pub billing_address: Option<BillingAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingAddress {
    #[serde(default)]
    pub street_address: Option<String>,

    #[serde(default)]
    pub street_address_2: Option<String>,

    #[serde(default)]
    pub city: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub postal_code: Option<String>,

    #[serde(default)]
    pub country: Option<String>,
}

/// Payload of a Klarna access token. Only the fields the core reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub client_id: String,

    #[serde(default)]
    pub iss: Option<String>,

    #[serde(default)]
    pub sub: Option<String>,

    #[serde(default)]
    pub scope: Option<String>,

    #[serde(default)]
    pub iat: Option<i64>,

    pub exp: i64,
}

impl IdentityClaims {
    /// Email trimmed, `None` when absent or blank.
    pub fn email(&self) -> Option<&str> {
        non_empty(self.email.as_deref())
    }

    pub fn billing(&self) -> BillingAddress {
        self.billing_address.clone().unwrap_or_default()
    }
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
