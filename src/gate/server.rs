//! Gateway HTTP server

use crate::gate::admin;
use crate::gate::config::GatewayConfig;
use crate::gate::handlers::{self, GatewayState};
use crate::{CredentialStore, KeyLog, ProviderDocument, ProviderRegistry};
use anyhow::Context;
use axum::{
    extract::{MatchedPath, Request},
    http::Method,
    middleware::{self, Next},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Build the gateway router. Admin routes exist only with an admin token.
pub fn build_router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/health", get(handlers::health));

    if state.admin_token.is_some() {
        app = app.nest("/admin", admin::routes(state.clone()));
    }

    app.with_state(state).layer(
        ServiceBuilder::new()
            .layer(cors)
            .layer(middleware::from_fn(logging_middleware)),
    )
}

/// Open the persistent stores described by `config`
pub fn open_state(config: &GatewayConfig) -> anyhow::Result<GatewayState> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data directory {}", config.data_dir.display()))?;

    let keys = CredentialStore::open(KeyLog::new(config.keys_path()))
        .with_context(|| format!("failed to open key log {}", config.keys_path().display()))?;
    let registry = ProviderRegistry::open(config.providers_path(), ProviderDocument::from_env)
        .with_context(|| format!("failed to open provider document {}", config.providers_path().display()))?;

    Ok(GatewayState::new(Arc::new(keys), Arc::new(registry), config)?)
}

/// Start the gateway server
pub async fn start_server(config: GatewayConfig) -> anyhow::Result<()> {
    let state = open_state(&config)?;

    if config.probe_on_startup {
        let prober = state.prober.clone();
        let registry = state.registry().clone();
        tokio::spawn(async move {
            prober.probe_all(&registry).await;
        });
    }

    if state.admin_token.is_none() {
        info!("Admin API disabled (no admin_token configured)");
    }

    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;

    info!("Starting Gateway on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
        })
        .await?;

    Ok(())
}

/// Logging middleware.
///
/// Logs the route template rather than the raw URI: admin paths carry API
/// keys as parameters.
async fn logging_middleware(req: Request, next: Next) -> axum::response::Response {
    let start = Instant::now();
    let method = req.method().clone();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "<unmatched>".to_string());

    let response = next.run(req).await;

    info!("{} {} {} {:?}", method, route, response.status(), start.elapsed());

    response
}
