//! API route definitions.

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;
use crate::config::ServerConfig;

/// Create the API router. The binary mounts it under `/api`.
pub fn create_router(state: AppState, config: &ServerConfig) -> Router {
    let cors = build_cors_layer(&config.cors_origins);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health))
        // Streaming relay
        .route("/relay/{*path}", post(handlers::relay))
        // Progress pass-through
        .route("/tasks/active", get(handlers::active_tasks))
        .route("/tasks/batches", get(handlers::active_batches))
        .route("/tasks/{task_id}/progress", get(handlers::task_progress))
        .route("/tasks/{task_id}", delete(handlers::clear_task))
        .layer(DefaultBodyLimit::max(
            config.max_body_size_mb.saturating_mul(1024 * 1024),
        ))
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}

/// Build the CORS layer. No configured origins allows any origin.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];

    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
        header::CACHE_CONTROL,
    ];

    if allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods(methods)
            .allow_headers(headers);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(true)
}
