//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the gateway:
//! - Request outcomes and latency
//! - Pending request count
//! - Reply matching
//! - Broker connection and reconnection attempts
//!
//! Recording is a no-op until a recorder is installed, so library code records
//! unconditionally.
//!
//! # Example
//!
//! ```rust,no_run
//! use certgate_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new();
//! server.start()?;
//!
//! // Render for GET /metrics
//! let body = server.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder holder.
///
/// Installs the global recorder and renders the text exposition format. The
/// HTTP route lives in the web crate.
#[derive(Default)]
pub struct MetricsServer {
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new, not yet installed, metrics server.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), this logs a warning
    /// and leaves `handle()` empty.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder hasn't been installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "gateway_requests_total",
        "Requests that reached a terminal outcome, by outcome"
    );
    describe_histogram!(
        "gateway_request_duration_seconds",
        "Time from submission to terminal outcome"
    );
    describe_gauge!(
        "gateway_pending_requests",
        "Requests published and waiting for a reply"
    );
    describe_counter!(
        "gateway_replies_total",
        "Replies consumed from the reply queue, by whether a caller was waiting"
    );
    describe_counter!(
        "gateway_reply_parse_errors_total",
        "Replies whose body could not be parsed"
    );
    describe_counter!(
        "broker_connections_total",
        "Successful broker session establishments"
    );
    describe_counter!(
        "broker_reconnect_attempts_total",
        "Scheduled reconnection attempts"
    );
}

/// Gateway metrics recorder.
pub struct GatewayMetrics;

impl GatewayMetrics {
    /// Record a terminal request outcome.
    pub fn record_outcome(outcome: &'static str, duration: Duration) {
        counter!("gateway_requests_total", "outcome" => outcome).increment(1);
        histogram!("gateway_request_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record the current number of pending requests.
    pub fn record_pending(count: usize) {
        // Pending count is bounded by memory; f64 represents it exactly up to 2^53
        #[allow(clippy::cast_precision_loss)]
        gauge!("gateway_pending_requests").set(count as f64);
    }

    /// Record a consumed reply.
    pub fn record_reply(matched: bool) {
        let matched = if matched { "true" } else { "false" };
        counter!("gateway_replies_total", "matched" => matched).increment(1);
    }

    /// Record a reply that failed to parse.
    pub fn record_parse_error() {
        counter!("gateway_reply_parse_errors_total").increment(1);
    }
}

/// Broker connection metrics recorder.
pub struct BrokerMetrics;

impl BrokerMetrics {
    /// Record a successful session establishment.
    pub fn record_connected() {
        counter!("broker_connections_total").increment(1);
    }

    /// Record a scheduled reconnection attempt.
    pub fn record_reconnect_attempt() {
        counter!("broker_reconnect_attempts_total").increment(1);
    }
}
