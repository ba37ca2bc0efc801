//! Sign in with Klarna endpoints
//!
//! The host storefront forwards the browser's token payload here together with
//! its own view of the session (`x-session-account`). When the response carries
//! `authenticate`, the host signs its session in as that account.

use async_trait::async_trait;
use axum::{
    extract::{FromRequest, Request, State},
    http::header,
    Form, Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::app::AppState;
use crate::auth::{HostSession, RequestSession};
use crate::config::WidgetAttributes;
use crate::error::{ApiError, ApiResult, SignInError};
use crate::services::accounts::AccountId;
use crate::services::{SignInEvent, SignInOutcome};

#[derive(Debug, Serialize)]
pub struct SignInResponse {
    pub success: bool,
    pub outcome: SignInOutcome,
    pub account_id: AccountId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticate: Option<AccountId>,
}

#[derive(Debug, Serialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub needs_sign_in: bool,
    pub widget: WidgetAttributes,
}

/// Sign-in event posted either as JSON or as a urlencoded form. An unreadable
/// body is answered like an event with every token missing.
pub struct SignInPayload(pub SignInEvent);

#[async_trait]
impl<S: Send + Sync> FromRequest<S> for SignInPayload {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));

        let event = if is_form {
            Form::<SignInEvent>::from_request(req, state)
                .await
                .map(|Form(event)| event)
                .map_err(|rejection| rejection.body_text())
        } else {
            Json::<SignInEvent>::from_request(req, state)
                .await
                .map(|Json(event)| event)
                .map_err(|rejection| rejection.body_text())
        };

        event.map(Self).map_err(|detail| {
            tracing::warn!(error = %detail, "Unreadable sign-in payload");
            SignInError::MissingParameters("id_token, access_token, refresh_token".to_string())
                .into()
        })
    }
}

/// POST /siwk/sign-in
pub async fn sign_in(
    State(state): State<Arc<AppState>>,
    session: RequestSession,
    SignInPayload(event): SignInPayload,
) -> ApiResult<Json<SignInResponse>> {
    let result = state.orchestrator.sign_in(event, &session).await?;

    Ok(Json(SignInResponse {
        success: true,
        outcome: result.outcome,
        account_id: result.account_id,
        authenticate: session.authenticated(),
    }))
}

/// GET /siwk/access-token
pub async fn access_token(
    State(state): State<Arc<AppState>>,
    session: RequestSession,
) -> ApiResult<Json<AccessTokenResponse>> {
    state
        .orchestrator
        .access_token(session.current_account())
        .await?
        .map(|access_token| Json(AccessTokenResponse { access_token }))
        .ok_or_else(|| ApiError::NotFound("No Klarna session for this account".to_string()))
}

/// POST /siwk/refresh
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    session: RequestSession,
) -> ApiResult<Json<AccessTokenResponse>> {
    let account = session
        .current_account()
        .ok_or_else(|| ApiError::BadRequest("Guests have no Klarna tokens".to_string()))?;

    state
        .orchestrator
        .refresh(account)
        .await?
        .map(|access_token| Json(AccessTokenResponse { access_token }))
        .ok_or_else(|| ApiError::NotFound("No Klarna session for this account".to_string()))
}

/// GET /siwk/status
pub async fn status(
    State(state): State<Arc<AppState>>,
    session: RequestSession,
) -> ApiResult<Json<StatusResponse>> {
    let needs_sign_in = state
        .orchestrator
        .needs_sign_in(session.current_account())
        .await?;

    Ok(Json(StatusResponse {
        needs_sign_in,
        widget: state.orchestrator.provider().config().widget_attributes(),
    }))
}
