//! HTTP and WebSocket surface.

pub mod error;
pub mod handlers;
pub mod state;
pub mod ws;

pub use error::ApiError;
pub use state::AppState;

use axum::Router;
use axum::routing::{delete, get, patch, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/repositories", post(handlers::create_repository))
        .route("/repositories", get(handlers::list_repositories))
        .route("/repositories/{id}", get(handlers::get_repository))
        .route("/repositories/{id}", patch(handlers::update_repository))
        .route("/repositories/{id}", delete(handlers::delete_repository))
        .route(
            "/repositories/{id}/restart",
            post(handlers::restart_repository),
        )
        .route("/repositories/{id}/status", get(handlers::repository_status))
        .route("/repositories/{id}/logs", get(handlers::repository_logs))
        .route("/repositories/{id}/logs/ws", get(ws::logs_ws))
        .route(
            "/repositories/{id}/deployments",
            get(handlers::list_deployments),
        )
        .route("/webhooks/{id}", post(handlers::receive_webhook))
        .layer(trace_layer)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
