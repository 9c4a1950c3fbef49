//! Router assembly and HTTP serving
//!
//! Middleware chain, outermost first: request context (id + access log +
//! metrics) → error envelope → CORS → auth → rate limit → handler.

use std::net::SocketAddr;

use axum::http::{HeaderName, HeaderValue, Method};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::info;

use modax_core::config::CorsConfig;

use crate::state::AppState;
use crate::{auth, handlers, middleware, rate_limit, ws};

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.api.cors);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::metrics_exposition))
        .route("/api/v1/status", get(handlers::system_status))
        .route("/api/v1/devices", get(handlers::list_devices))
        .route("/api/v1/devices/:id/data", get(handlers::device_data))
        .route("/api/v1/devices/:id/history", get(handlers::device_history))
        .route("/api/v1/devices/:id/safety", get(handlers::device_safety))
        .route(
            "/api/v1/devices/:id/ai-analysis",
            get(handlers::device_ai_analysis),
        )
        .route("/api/v1/control/command", post(handlers::dispatch_command))
        .route("/api/v1/cnc/emergency-stop", post(handlers::emergency_stop))
        .route("/api/v1/export/:id/:format", get(handlers::export_device))
        .route("/api/v1/cache/stats", get(handlers::cache_stats))
        .route("/ws", get(ws::ws_global))
        .route("/ws/device/:id", get(ws::ws_device))
        .with_state(state.clone())
        .layer(from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_middleware,
        ))
        .layer(from_fn_with_state(state, auth::auth_middleware))
        .layer(cors)
        .layer(from_fn(middleware::error_envelope))
        .layer(from_fn(middleware::request_context))
}

fn cors_layer(cfg: &CorsConfig) -> CorsLayer {
    let mut layer = CorsLayer::new();

    layer = match &cfg.origins {
        None => layer.allow_origin(Any),
        Some(origins) => layer.allow_origin(AllowOrigin::list(
            origins
                .iter()
                .filter_map(|o| o.parse::<HeaderValue>().ok()),
        )),
    };

    let methods: Vec<Method> = cfg
        .allow_methods
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();
    let headers: Vec<HeaderName> = cfg
        .allow_headers
        .iter()
        .filter_map(|h| h.parse().ok())
        .collect();

    layer
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(cfg.allow_credentials)
}

/// Bind and serve until the shutdown signal flips. In-flight handlers get
/// the graceful-shutdown window; the caller enforces the hard deadline.
pub async fn serve(state: AppState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.api.host, state.config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API listening on {}", listener.local_addr()?);

    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await?;

    Ok(())
}
