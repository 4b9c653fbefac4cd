use axum::{
    http::HeaderValue,
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::handlers;
use crate::middleware::timing;
use crate::AppState;

/// Builds the full axum `Router`: the versioned control plane, the
/// bulk-HTTP data endpoints, and the WebSocket upgrade.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        // ── Stream lifecycle ────────────────────────────────────
        .route("/api/v1/stream/start", post(handlers::stream::start_stream))
        .route(
            "/api/v1/stream/:id/cancel",
            post(handlers::stream::cancel_stream),
        )
        .route(
            "/api/v1/stream/:id/complete",
            post(handlers::stream::complete_stream),
        )
        .route("/api/v1/stream/:id", get(handlers::stream::get_stream))
        .route("/api/v1/stream/:id/ws", get(handlers::ws::stream_ws))
        // ── Probes & bulk-HTTP data plane ───────────────────────
        .route("/api/v1/ping", get(handlers::data::ping))
        .route("/api/v1/health", get(handlers::data::health))
        .route("/api/v1/download", get(handlers::data::download))
        .route("/api/v1/upload", post(handlers::data::upload))
        // ── Provide shared state to all routes above ────────────
        .with_state(state)
        // ── Global middleware (applied bottom-up) ───────────────
        .layer(axum_mw::from_fn(timing::trace_requests))
        .layer(cors)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.iter().any(|origin| origin == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}
