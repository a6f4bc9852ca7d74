//! Application state for Axum handlers.

use certgate_runtime::GatewayService;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Application state shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// The gateway every handler talks to.
    pub service: Arc<GatewayService>,
    /// Prometheus renderer; `None` disables `GET /metrics`.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Create state around a gateway, without metrics.
    #[must_use]
    pub const fn new(service: Arc<GatewayService>) -> Self {
        Self { service, metrics: None }
    }

    /// Serve metrics rendered by `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_clone() {
        // Axum requires Clone state
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}
