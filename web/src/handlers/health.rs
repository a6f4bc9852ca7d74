//! Health and metrics endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems
//! to verify service health.

use crate::error::AppError;
use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use certgate_runtime::HealthSnapshot;

/// Gateway health with broker diagnostics.
///
/// # Status Codes
///
/// - 200 OK: broker connected
/// - 503 Service Unavailable: broker disconnected
///
/// # Endpoint
///
/// ```text
/// GET /health
/// ```
///
/// # Response
///
/// ```json
/// {
///   "status": "OK",
///   "brokerConnected": true,
///   "connectionState": "connected",
///   "pendingRequests": 0,
///   "connectionRetries": 0,
///   "uptime": 12.5
/// }
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthSnapshot>) {
    let snapshot = state.service.health();

    let status = if snapshot.status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(snapshot))
}

/// Prometheus text exposition.
///
/// # Errors
///
/// Returns 404 when metrics are disabled.
#[allow(clippy::unused_async)]
pub async fn metrics(State(state): State<AppState>) -> Result<String, AppError> {
    state
        .metrics
        .as_ref()
        .map(metrics_exporter_prometheus::PrometheusHandle::render)
        .ok_or_else(|| AppError::not_found("metrics disabled"))
}
