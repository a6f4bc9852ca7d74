//! Router configuration.

use crate::handlers::{health_check, metrics, request_certificate};
use crate::state::AppState;
use axum::{
    Router,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the complete Axum router.
///
/// Routes:
/// - `POST /solicitar-certificado`
/// - `GET /health`
/// - `GET /metrics`
///
/// CORS is permissive; the form is served from another origin.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/solicitar-certificado", post(request_certificate))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
