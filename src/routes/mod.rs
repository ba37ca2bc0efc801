pub mod health;
pub mod siwk;

use axum::{routing::get, routing::post, Router};
use std::sync::Arc;

use crate::app::AppState;

/// Build the API router with all routes
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health_check))
        // Sign in with Klarna
        .route("/siwk/sign-in", post(siwk::sign_in))
        .route("/siwk/access-token", get(siwk::access_token))
        .route("/siwk/refresh", post(siwk::refresh))
        .route("/siwk/status", get(siwk::status))
}
