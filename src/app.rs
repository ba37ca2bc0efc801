use axum::Router;
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::routes;
use crate::services::{RedisAccessCache, SignInOrchestrator};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: SignInOrchestrator,
    /// Backends probed by the health endpoint; absent when running on
    /// in-memory stores.
    pub db: Option<PgPool>,
    pub cache: Option<RedisAccessCache>,
}

impl AppState {
    pub fn new(orchestrator: SignInOrchestrator) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            db: None,
            cache: None,
        })
    }

    pub fn with_backends(
        orchestrator: SignInOrchestrator,
        db: PgPool,
        cache: RedisAccessCache,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            db: Some(db),
            cache: Some(cache),
        })
    }
}

/// Build the complete application with all middleware
pub fn create_app(state: Arc<AppState>) -> Router {
    // Spans at DEBUG; sign-in outcomes are logged by the orchestrator itself
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    Router::new()
        .merge(routes::api_router())
        .layer(trace_layer)
        .with_state(state)
}
