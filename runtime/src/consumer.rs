//! Reply queue consumer.
//!
//! Drains the reply queue, hands each reply to the [`CorrelationRegistry`] and
//! acknowledges every delivery once it has been looked at, matched or not.
//! Unmatched, unparsable and token-less replies are logged and dropped; none
//! of them stop the consumer.

use crate::metrics::GatewayMetrics;
use crate::registry::CorrelationRegistry;
use certgate_core::broker::{Delivery, DeliveryStream};
use certgate_core::{CorrelationToken, ReplyPayload};
use futures::StreamExt;

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// A waiting caller received the reply.
    Matched,
    /// No caller was waiting (late, duplicate or foreign reply).
    Unmatched,
    /// The message carried no usable correlation token.
    MissingToken,
    /// The body was not a valid reply.
    Malformed,
}

/// Consumes replies and resolves pending requests.
#[derive(Debug, Clone)]
pub struct ReplyConsumer {
    registry: CorrelationRegistry,
}

impl ReplyConsumer {
    /// Create a consumer resolving into `registry`.
    #[must_use]
    pub const fn new(registry: CorrelationRegistry) -> Self {
        Self { registry }
    }

    /// Process deliveries until the stream ends.
    ///
    /// The stream ends when the channel closes; reconnection starts a new
    /// consumer on the new channel.
    pub async fn run(self, mut deliveries: DeliveryStream) {
        tracing::info!("Reply consumer started");

        while let Some(next) = deliveries.next().await {
            match next {
                Ok(delivery) => {
                    self.handle(delivery).await;
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Reply stream error");
                },
            }
        }

        tracing::info!("Reply consumer stopped (stream ended)");
    }

    /// Process one delivery and acknowledge it.
    pub async fn handle(&self, delivery: Delivery) -> ReplyDisposition {
        let disposition = self.dispatch(&delivery);
        GatewayMetrics::record_reply(disposition == ReplyDisposition::Matched);

        if let Err(e) = delivery.ack().await {
            tracing::warn!(error = %e, ?disposition, "Failed to ack reply");
        }
        disposition
    }

    fn dispatch(&self, delivery: &Delivery) -> ReplyDisposition {
        let payload = match ReplyPayload::from_slice(&delivery.body) {
            Ok(payload) => payload,
            Err(e) => {
                GatewayMetrics::record_parse_error();
                tracing::warn!(
                    correlation_id = delivery.properties.correlation_id.as_deref().unwrap_or("-"),
                    error = %e,
                    "Discarding malformed reply"
                );
                return ReplyDisposition::Malformed;
            },
        };

        let Some(raw_token) = delivery.properties.correlation_id.as_deref() else {
            tracing::warn!("Discarding reply without correlation id");
            return ReplyDisposition::MissingToken;
        };

        let Ok(token) = raw_token.parse::<CorrelationToken>() else {
            tracing::warn!(correlation_id = raw_token, "Discarding reply for unknown correlation id");
            return ReplyDisposition::Unmatched;
        };

        if self.registry.resolve(&token, payload) {
            ReplyDisposition::Matched
        } else {
            tracing::warn!(correlation_id = %token, "Discarding reply for unknown correlation id");
            ReplyDisposition::Unmatched
        }
    }
}
