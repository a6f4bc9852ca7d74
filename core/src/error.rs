//! Terminal failures of a gateway request.
//!
//! Every submitted request ends in exactly one outcome: a [`ReplyPayload`] or
//! one of these errors. Broker-side faults that no caller is waiting on
//! (unknown or late replies) are logged where they happen and never become a
//! `GatewayError`.
//!
//! [`ReplyPayload`]: crate::message::ReplyPayload

use thiserror::Error;

/// Errors a caller of the gateway can observe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Input rejected before anything was published.
    #[error("{0}")]
    Validation(String),

    /// The broker is unreachable and one reconnection attempt did not help.
    #[error("broker unavailable: {0}")]
    ServiceUnavailable(String),

    /// Reply infrastructure is not ready (no reply queue declared).
    #[error("gateway misconfigured: {0}")]
    Config(String),

    /// The request could not be handed to the broker.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Unexpected local failure (serialization, duplicate token, dropped sink).
    #[error("internal error: {0}")]
    Internal(String),

    /// No reply arrived within the request timeout.
    #[error("no reply within {timeout_ms} ms")]
    Timeout {
        /// The timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },
}

impl GatewayError {
    /// HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::ServiceUnavailable(_) => 503,
            Self::Config(_) | Self::Publish(_) | Self::Internal(_) => 500,
            Self::Timeout { .. } => 504,
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Publish(_) => "PUBLISH_ERROR",
            Self::Internal(_) => "INTERNAL_SERVER_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
        }
    }

    /// Label used for the `outcome` metric dimension.
    #[must_use]
    pub const fn outcome_label(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ServiceUnavailable(_) => "unavailable",
            Self::Config(_) => "config",
            Self::Publish(_) => "publish",
            Self::Internal(_) => "internal",
            Self::Timeout { .. } => "timeout",
        }
    }
}
