use anyhow::Result;
use std::sync::Arc;

use klarna_signin::auth::JwksCache;
use klarna_signin::db::{PgAccountStore, PgAttributeStore};
use klarna_signin::services::{
    AccountResolver, KlarnaClient, RedisAccessCache, SignInOrchestrator, TokenStore,
};
use klarna_signin::{app, config, db, logging};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = config::Settings::from_env()?;

    // Initialize logging
    logging::init_logging(&settings.env);

    tracing::info!(
        env = ?settings.env,
        server_addr = %settings.server_addr,
        klarna_environment = settings.provider.environment.as_str(),
        "Starting Sign in with Klarna service"
    );

    // Create database pool
    let pool = db::create_pool(&settings).await?;

    // Create Redis access token cache
    let cache = RedisAccessCache::new(&settings.redis_url).await?;

    let attributes = Arc::new(PgAttributeStore::new(pool.clone()));
    let tokens = TokenStore::new(
        attributes.clone(),
        Arc::new(cache.clone()),
        settings.provider.early_refresh_seconds,
    );
    let accounts = AccountResolver::new(Arc::new(PgAccountStore::new(pool.clone())), attributes);

    // Create JWKS cache for token verification
    let jwks_cache = JwksCache::new(&settings.provider)?;

    // Optionally warm the JWKS cache
    if let Err(e) = jwks_cache.warm_cache().await {
        tracing::warn!(error = %e, "Failed to warm JWKS cache - will fetch on first request");
    }

    let provider = KlarnaClient::new(settings.provider.clone())?;
    let orchestrator = SignInOrchestrator::new(jwks_cache, provider, accounts, tokens);

    // Create application state
    let state = app::AppState::with_backends(orchestrator, pool, cache);

    // Build application
    let app = app::create_app(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&settings.server_addr).await?;
    tracing::info!("Listening on {}", settings.server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
