//! HTTP-facing request entry point.
//!
//! [`RequestGateway::submit`] turns one `(cpf, nome)` pair into one published
//! request and waits for its single terminal outcome.

use crate::connection::BrokerConnectionManager;
use crate::metrics::GatewayMetrics;
use crate::registry::{CorrelationRegistry, ResponseSink};
use certgate_core::broker::MessageProperties;
use certgate_core::environment::Clock;
use certgate_core::{CertificateRequest, CorrelationToken, GatewayError, ReplyPayload};
use std::sync::Arc;
use tokio::time::Instant;

/// Publishes certificate requests and awaits their replies.
#[derive(Clone)]
pub struct RequestGateway {
    connection: BrokerConnectionManager,
    registry: CorrelationRegistry,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RequestGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGateway")
            .field("registry", &self.registry)
            .field("state", &self.connection.state())
            .finish_non_exhaustive()
    }
}

impl RequestGateway {
    /// Create a gateway publishing through `connection` and waiting on `registry`.
    #[must_use]
    pub fn new(connection: BrokerConnectionManager, registry: CorrelationRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            connection,
            registry,
            clock,
        }
    }

    /// Submit a certificate lookup and wait for its outcome.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Validation`] when `cpf` or `nome` is empty
    /// - [`GatewayError::ServiceUnavailable`] when the broker stays unreachable
    ///   after one connection attempt; nothing is published
    /// - [`GatewayError::Config`] when the session has no reply queue
    /// - [`GatewayError::Publish`] when the broker rejects the message
    /// - [`GatewayError::Internal`] on serialization or token collisions
    /// - [`GatewayError::Timeout`] when no reply arrives in time
    pub async fn submit(&self, cpf: &str, nome: &str) -> Result<ReplyPayload, GatewayError> {
        let started = Instant::now();
        let outcome = self.submit_inner(cpf, nome).await;

        let label = match &outcome {
            Ok(_) => "success",
            Err(e) => e.outcome_label(),
        };
        GatewayMetrics::record_outcome(label, started.elapsed());
        outcome
    }

    async fn submit_inner(&self, cpf: &str, nome: &str) -> Result<ReplyPayload, GatewayError> {
        if cpf.is_empty() || nome.is_empty() {
            return Err(GatewayError::Validation("CPF e nome são obrigatórios".to_string()));
        }

        let active = self.ensure_session().await?;
        if active.reply_queue.is_empty() {
            tracing::error!("Reply queue not declared on the active session");
            return Err(GatewayError::Config("reply queue not declared".to_string()));
        }

        let token = CorrelationToken::generate();
        let (sink, handle) = ResponseSink::channel();
        self.registry
            .register(token, sink)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let request = CertificateRequest {
            cpf: cpf.to_string(),
            nome: nome.to_string(),
            timestamp: self.clock.now().timestamp_millis(),
        };
        let body = match serde_json::to_vec(&request) {
            Ok(body) => body,
            Err(e) => {
                self.registry.discard(&token);
                return Err(GatewayError::Internal(format!("failed to encode request: {e}")));
            },
        };

        let properties = MessageProperties {
            correlation_id: Some(token.to_string()),
            reply_to: Some(active.reply_queue.clone()),
            persistent: true,
            expiration: Some(self.registry.timeout().as_millis().to_string()),
            content_type: Some("application/json".to_string()),
        };

        let request_queue = &self.connection.topology().request_queue;
        let publish = active.session.publish(request_queue, body, properties);
        let outcome = handle.outcome();
        tokio::pin!(outcome);

        // The record's timer keeps running while the broker holds the publish.
        tokio::select! {
            published = publish => {
                if let Err(e) = published {
                    self.registry.discard(&token);
                    tracing::error!(correlation_id = %token, error = %e, "Failed to publish request");
                    return Err(GatewayError::Publish(e.to_string()));
                }
            },
            finished = &mut outcome => {
                tracing::warn!(correlation_id = %token, "Request finished while its publish was still pending");
                return finished;
            },
        }

        tracing::info!(
            correlation_id = %token,
            queue = %request_queue,
            pending = self.registry.len(),
            "Request published"
        );
        outcome.await
    }

    async fn ensure_session(&self) -> Result<crate::connection::ActiveSession, GatewayError> {
        if let Some(active) = self.connection.active_session() {
            return Ok(active);
        }

        tracing::warn!("Broker unavailable, attempting to reconnect before publishing");
        if let Err(e) = self.connection.connect().await {
            tracing::warn!(error = %e, "Reconnection on demand failed");
        }

        self.connection.active_session().ok_or_else(|| {
            GatewayError::ServiceUnavailable("broker connection is not available".to_string())
        })
    }
}
