//! Error taxonomy for the sign-in core and its HTTP mapping.
//!
//! Every failure is returned as a typed value; the HTTP layer logs the detail
//! and answers with a stable code plus a message that is safe to show.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Structural or cryptographic problems with a single token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("invalid token header: {0}")]
    Header(#[source] jsonwebtoken::errors::Error),

    #[error("unsupported token algorithm: {0:?}")]
    UnsupportedAlgorithm(jsonwebtoken::Algorithm),

    #[error("no signing key matches kid {0:?}")]
    KeyNotFound(Option<String>),

    #[error("signature verification failed: {0}")]
    Verification(#[source] jsonwebtoken::errors::Error),

    #[error("jwks fetch failed: {0}")]
    JwksFetch(String),
}

#[derive(Debug, Error)]
pub enum SignInError {
    /// Inbound event lacked a required field.
    #[error("missing parameters: {0}")]
    MissingParameters(String),

    #[error("invalid token: {0}")]
    InvalidToken(#[from] TokenError),

    /// Transport-level failure talking to the identity provider.
    #[error("identity provider unreachable: {0}")]
    Network(String),

    /// The provider answered >= 400; the refresh token is no longer usable.
    #[error("identity provider rejected the request with status {status}")]
    ProviderRejected { status: u16 },

    /// Stored record was issued by a different issuer or client than configured.
    #[error("refresh token belongs to issuer {issuer} / client {client_id}")]
    EnvironmentMismatch { issuer: String, client_id: String },

    #[error("account creation failed: {0}")]
    AccountCreationFailed(String),

    #[error("storage error")]
    Storage(#[from] anyhow::Error),
}

impl SignInError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingParameters(_) => "MISSING_PARAMETERS",
            Self::InvalidToken(_) => "INVALID_TOKEN",
            Self::Network(_) => "PROVIDER_UNAVAILABLE",
            Self::ProviderRejected { .. } => "PROVIDER_REJECTED",
            Self::EnvironmentMismatch { .. } => "ENVIRONMENT_MISMATCH",
            Self::AccountCreationFailed(_) => "ACCOUNT_CREATION_FAILED",
            Self::Storage(_) => "INTERNAL_ERROR",
        }
    }

    /// Message that never echoes token material or internals.
    pub fn public_message(&self) -> String {
        match self {
            Self::MissingParameters(fields) => format!("Missing parameters: {}", fields),
            Self::InvalidToken(_) => "The sign-in token could not be verified".to_string(),
            Self::Network(_) => "Klarna is currently unreachable, please try again".to_string(),
            Self::ProviderRejected { .. } | Self::EnvironmentMismatch { .. } => {
                "Your Klarna session has ended, please sign in again".to_string()
            }
            Self::AccountCreationFailed(_) => "Could not create an account".to_string(),
            Self::Storage(_) => "An internal error occurred".to_string(),
        }
    }

    /// Whether a higher layer may retry the same call later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingParameters(_) => StatusCode::BAD_REQUEST,
            Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            Self::Network(_) => StatusCode::BAD_GATEWAY,
            Self::ProviderRejected { .. } | Self::EnvironmentMismatch { .. } => {
                StatusCode::UNAUTHORIZED
            }
            Self::AccountCreationFailed(_) => StatusCode::CONFLICT,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    SignIn(#[from] SignInError),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::SignIn(e) => e.status_code(),
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::SignIn(e) => e.error_code(),
        }
    }

    fn public_message(&self) -> String {
        match self {
            Self::BadRequest(msg) | Self::NotFound(msg) => msg.clone(),
            Self::SignIn(e) => e.public_message(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            Self::SignIn(SignInError::Storage(e)) => {
                tracing::error!(error = ?e, "Storage error during sign-in");
            }
            Self::SignIn(e) => {
                tracing::warn!(code = e.error_code(), error = %e, "Sign-in failed");
            }
            _ => {
                tracing::warn!(error = %self, "API error");
            }
        }

        let body = ErrorResponse {
            success: false,
            code: self.error_code().to_string(),
            message: self.public_message(),
        };

        (self.status_code(), Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_messages_do_not_leak_detail() {
        let err = SignInError::InvalidToken(TokenError::Malformed("eyJhbGciOi...".into()));
        assert_eq!(err.error_code(), "INVALID_TOKEN");
        assert!(!err.public_message().contains("eyJ"));

        let err = SignInError::Storage(anyhow::anyhow!("connection refused to 10.0.0.3"));
        assert!(!err.public_message().contains("10.0.0.3"));
    }

    #[test]
    fn only_network_errors_are_transient() {
        assert!(SignInError::Network("timeout".into()).is_transient());
        assert!(!SignInError::ProviderRejected { status: 400 }.is_transient());
        assert!(!SignInError::MissingParameters("id_token".into()).is_transient());
    }

    #[test]
    fn rejected_sessions_map_to_unauthorized() {
        let response = ApiError::from(SignInError::ProviderRejected { status: 403 }).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response =
            ApiError::from(SignInError::AccountCreationFailed("dup".into())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
