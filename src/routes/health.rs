use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::app::AppState;
use crate::db;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub services: ServiceHealth,
}

#[derive(Serialize)]
pub struct ServiceHealth {
    pub database: String,
    pub redis: String,
}

/// Health check endpoint - public
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let database = match &state.db {
        Some(pool) => Some(db::health_check(pool).await),
        None => None,
    };
    let redis = match &state.cache {
        Some(cache) => Some(cache.health_check().await.is_ok()),
        None => None,
    };

    // Tokens cannot be linked without the database; a cache outage only
    // forces extra refresh-token redemptions
    let status = match (database, redis) {
        (Some(false), _) => "unhealthy",
        (_, Some(false)) => "degraded",
        _ => "healthy",
    };

    let status_code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status_code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            services: ServiceHealth {
                database: label(database),
                redis: label(redis),
            },
        }),
    )
}

fn label(probe: Option<bool>) -> String {
    match probe {
        Some(true) => "ok",
        Some(false) => "error",
        None => "in_memory",
    }
    .to_string()
}
