use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use playtrack_engine::HealthState;
use playtrack_feed::FeedStatus;
use playtrack_store::QueryFacade;

use crate::handlers;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8085 }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<QueryFacade>,
    pub health: Arc<HealthState>,
    pub feed_status: Arc<FeedStatus>,
    pub metrics: PrometheusHandle,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/api/stats/summary", get(handlers::summary))
        .route("/api/stats/daily", get(handlers::daily))
        .route("/api/stats/users", get(handlers::users))
        .route("/api/stats/top-media", get(handlers::top_media))
        .route("/api/sessions/active", get(handlers::active_sessions))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Create and start the server. Returns a handle that keeps it alive.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "http server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
    })
}

/// Handle returned by `start()` — keeps the serve task alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}
