//! Read-only health snapshot.

use crate::connection::{BrokerConnectionManager, ConnectionState};
use crate::registry::CorrelationRegistry;
use serde::Serialize;
use tokio::time::Instant;

/// Overall gateway health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    /// Broker session open; requests can be served.
    #[serde(rename = "OK")]
    Ok,
    /// No usable broker session.
    Disconnected,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Point-in-time view of the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// `OK` when the broker is connected.
    pub status: HealthStatus,
    /// Connection and channel both open.
    pub broker_connected: bool,
    /// Lifecycle state of the connection manager.
    pub connection_state: ConnectionState,
    /// Requests waiting for a reply.
    pub pending_requests: usize,
    /// Consecutive reconnection attempts.
    pub connection_retries: u32,
    /// Seconds since the reporter was created.
    pub uptime: f64,
}

/// Builds [`HealthSnapshot`]s. Never mutates what it observes.
#[derive(Clone)]
pub struct HealthReporter {
    connection: BrokerConnectionManager,
    registry: CorrelationRegistry,
    started_at: Instant,
}

impl HealthReporter {
    /// Create a reporter; uptime counts from now.
    #[must_use]
    pub fn new(connection: BrokerConnectionManager, registry: CorrelationRegistry) -> Self {
        Self {
            connection,
            registry,
            started_at: Instant::now(),
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        let broker_connected = self.connection.is_available();
        HealthSnapshot {
            status: if broker_connected {
                HealthStatus::Ok
            } else {
                HealthStatus::Disconnected
            },
            broker_connected,
            connection_state: self.connection.state(),
            pending_requests: self.registry.len(),
            connection_retries: self.connection.retries(),
            uptime: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn status_serializes_like_the_http_contract() {
        assert_eq!(serde_json::to_value(HealthStatus::Ok).unwrap(), "OK");
        assert_eq!(serde_json::to_value(HealthStatus::Disconnected).unwrap(), "Disconnected");
        assert!(HealthStatus::Ok.is_healthy());
        assert!(!HealthStatus::Disconnected.is_healthy());
    }

    #[test]
    fn snapshot_uses_camel_case_fields() {
        let snapshot = HealthSnapshot {
            status: HealthStatus::Disconnected,
            broker_connected: false,
            connection_state: ConnectionState::Connecting,
            pending_requests: 3,
            connection_retries: 2,
            uptime: 1.5,
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["brokerConnected"], false);
        assert_eq!(json["connectionState"], "connecting");
        assert_eq!(json["pendingRequests"], 3);
        assert_eq!(json["connectionRetries"], 2);
        assert_eq!(json["uptime"], 1.5);
    }
}
