//! The gateway as one owned service object.
//!
//! [`GatewayService`] wires the registry, connection manager, reaper, gateway
//! and health reporter together and gives them a single `start`/`stop`
//! lifecycle. HTTP handlers receive it through shared state.

use crate::connection::{BrokerConnectionManager, Topology};
use crate::gateway::RequestGateway;
use crate::health::{HealthReporter, HealthSnapshot};
use crate::reaper::TimeoutReaper;
use crate::registry::CorrelationRegistry;
use crate::retry::BackoffPolicy;
use certgate_core::environment::{Clock, SystemClock};
use certgate_core::{BrokerTransport, GatewayError, ReplyPayload};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Runtime settings of a [`GatewayService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Queues declared on each session.
    pub topology: Topology,
    /// Reconnection schedule.
    pub backoff: BackoffPolicy,
    /// Upper bound on opening a session and declaring its topology.
    pub connect_timeout: Duration,
    /// How long a caller waits for a reply.
    pub request_timeout: Duration,
    /// Upper bound on closing the broker session during `stop`.
    pub shutdown_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            backoff: BackoffPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Owns every gateway component.
pub struct GatewayService {
    registry: CorrelationRegistry,
    connection: BrokerConnectionManager,
    gateway: RequestGateway,
    health: HealthReporter,
    reaper: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl GatewayService {
    /// Build a stopped service using the system clock.
    #[must_use]
    pub fn new(transport: Arc<dyn BrokerTransport>, config: GatewayConfig) -> Self {
        Self::with_clock(transport, config, Arc::new(SystemClock))
    }

    /// Build a stopped service with an injected clock for request timestamps.
    #[must_use]
    pub fn with_clock(transport: Arc<dyn BrokerTransport>, config: GatewayConfig, clock: Arc<dyn Clock>) -> Self {
        let registry = CorrelationRegistry::new(config.request_timeout);
        let connection = BrokerConnectionManager::new(
            transport,
            config.topology,
            config.backoff,
            config.connect_timeout,
            registry.clone(),
        );
        let gateway = RequestGateway::new(connection.clone(), registry.clone(), clock);
        let health = HealthReporter::new(connection.clone(), registry.clone());

        Self {
            registry,
            connection,
            gateway,
            health,
            reaper: Mutex::new(None),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Start the timeout reaper and make the first connection attempt.
    ///
    /// A failed first attempt is not fatal: reconnection continues in the
    /// background and requests see `ServiceUnavailable` until it succeeds.
    pub async fn start(&self) {
        {
            let mut reaper = self.reaper.lock().unwrap_or_else(PoisonError::into_inner);
            if reaper.is_none() {
                *reaper = Some(TimeoutReaper::new(self.registry.clone()).spawn());
            }
        }

        match self.connection.connect().await {
            Ok(()) => tracing::info!("Gateway started"),
            Err(e) => tracing::warn!(error = %e, "Gateway started without broker, reconnecting in background"),
        }
    }

    /// Submit one certificate request. See [`RequestGateway::submit`].
    ///
    /// # Errors
    ///
    /// Returns the request's terminal [`GatewayError`].
    pub async fn submit(&self, cpf: &str, nome: &str) -> Result<ReplyPayload, GatewayError> {
        self.gateway.submit(cpf, nome).await
    }

    /// Current health snapshot.
    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Pending-request registry.
    #[must_use]
    pub const fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    /// Broker connection manager.
    #[must_use]
    pub const fn connection(&self) -> &BrokerConnectionManager {
        &self.connection
    }

    /// Stop background work, close the broker session and fail every
    /// pending request with `ServiceUnavailable`.
    pub async fn stop(&self) {
        tracing::info!("Stopping gateway");

        let reaper = self.reaper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(reaper) = reaper {
            reaper.abort();
        }

        if tokio::time::timeout(self.shutdown_timeout, self.connection.stop())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Broker session did not close in time"
            );
        }

        let failed = self
            .registry
            .fail_all(&GatewayError::ServiceUnavailable("gateway shutting down".to_string()));
        tracing::info!(failed_pending = failed, "Gateway stopped");
    }
}
