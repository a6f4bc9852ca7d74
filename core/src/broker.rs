//! Broker abstraction for request/reply messaging.
//!
//! This module provides the [`BrokerTransport`] and [`BrokerSession`] traits the
//! gateway uses to talk to a queueing broker. A *session* is one live
//! connection together with the single channel used for every queue operation;
//! the two are created together and discarded together.
//!
//! # Topology
//!
//! ```text
//!                 publish (reply_to, correlation_id)
//! ┌──────────┐ ─────────────────────────────────────► ┌───────────────┐
//! │ Gateway  │                                         │ request queue │──► worker
//! └──────────┘ ◄───────────────────────────────────── ┌───────────────┐      │
//!                 consume + ack                        │  reply queue  │◄─────┘
//!                                                      └───────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: the broker may redeliver; unmatched replies are dropped
//! - **No cross-token ordering**: replies for different tokens arrive in any order
//! - **Explicit acks**: every consumed [`Delivery`] is acked by the consumer
//!
//! # Implementations
//!
//! - `AmqpTransport` in `certgate-amqp` - RabbitMQ via AMQP 0-9-1
//! - `InMemoryBroker` in `certgate-testing` - deterministic, with fault injection
//!
//! # Dyn Compatibility
//!
//! The traits return `Pin<Box<dyn Future>>` instead of using `async fn` so they
//! can be held as `Arc<dyn BrokerTransport>` and `Arc<dyn BrokerSession>`.

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Stream of deliveries from a consumed queue.
///
/// The stream ends when the underlying channel goes away.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Errors that can occur during broker operations.
///
/// `Clone` so a single failed connection attempt can be reported to every
/// caller that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker is unreachable or refused the connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Declaring, deleting or purging a queue failed
    #[error("Queue operation '{operation}' failed for '{queue}': {reason}")]
    QueueOperation {
        /// The operation that failed (declare, delete, purge)
        operation: &'static str,
        /// The queue involved
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to publish a message
    #[error("Publish failed for queue '{queue}': {reason}")]
    PublishFailed {
        /// The target queue
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to start consuming a queue
    #[error("Consume failed for queue '{queue}': {reason}")]
    ConsumeFailed {
        /// The queue that could not be consumed
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to acknowledge a delivery
    #[error("Ack failed: {0}")]
    AckFailed(String),

    /// The session is closed or closing
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// The gateway is shutting down
    #[error("Shutting down")]
    ShuttingDown,
}

/// Why a session stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The connection reported an error.
    Error(String),
    /// The connection closed without an error.
    Closed,
}

/// Message properties relevant to request/reply correlation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Token echoed back by the worker.
    pub correlation_id: Option<String>,
    /// Queue the worker should publish its reply to.
    pub reply_to: Option<String>,
    /// Survive a broker restart.
    pub persistent: bool,
    /// Per-message time-to-live in milliseconds, as a decimal string.
    pub expiration: Option<String>,
    /// MIME type of the body.
    pub content_type: Option<String>,
}

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Survive a broker restart.
    pub durable: bool,
    /// Restrict to the declaring connection.
    pub exclusive: bool,
    /// Delete when the last consumer goes away.
    pub auto_delete: bool,
    /// `x-message-ttl` argument in milliseconds.
    pub message_ttl_ms: Option<u32>,
}

impl QueueSpec {
    /// Durable request queue with a per-message TTL.
    #[must_use]
    pub fn request_queue(name: impl Into<String>, message_ttl_ms: u32) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            message_ttl_ms: Some(message_ttl_ms),
        }
    }

    /// Durable, shared, persistent reply queue.
    ///
    /// Outlives gateway restarts so the broker keeps accepting late replies.
    #[must_use]
    pub fn reply_queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            message_ttl_ms: None,
        }
    }
}

/// Acknowledgement capability for one delivery.
pub trait Acknowledger: Send {
    /// Acknowledge the delivery.
    fn ack(self: Box<Self>) -> BrokerFuture<'static, ()>;
}

/// A message consumed from a queue.
pub struct Delivery {
    /// Message properties.
    pub properties: MessageProperties,
    /// Raw body.
    pub body: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery with its acknowledgement capability.
    #[must_use]
    pub fn new(properties: MessageProperties, body: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            properties,
            body,
            acker,
        }
    }

    /// Acknowledge this delivery. Consumes it, so it can only happen once.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AckFailed`] if the broker rejects the ack.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Factory for broker sessions.
///
/// All implementations must be `Send + Sync`; the connection manager shares one
/// transport across reconnect attempts.
pub trait BrokerTransport: Send + Sync {
    /// Check that the broker endpoint is reachable without opening a session.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the endpoint cannot be reached.
    fn probe(&self) -> BrokerFuture<'_, ()>;

    /// Open a connection and a channel on it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if either cannot be opened.
    fn connect(&self) -> BrokerFuture<'_, std::sync::Arc<dyn BrokerSession>>;
}

/// One live connection plus its channel.
pub trait BrokerSession: Send + Sync {
    /// True while both the connection and the channel are open.
    fn is_open(&self) -> bool;

    /// Delete a queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::QueueOperation`] on failure.
    fn delete_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()>;

    /// Declare a queue, returning the name the broker assigned.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::QueueOperation`] on failure.
    fn declare_queue<'a>(&'a self, spec: &'a QueueSpec) -> BrokerFuture<'a, String>;

    /// Drop all ready messages from a queue, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::QueueOperation`] on failure.
    fn purge_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, u32>;

    /// Publish a message directly to a queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the broker does not accept it.
    fn publish<'a>(
        &'a self,
        queue: &'a str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> BrokerFuture<'a, ()>;

    /// Start consuming a queue with manual acknowledgements.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConsumeFailed`] if the subscription is refused.
    fn consume<'a>(&'a self, queue: &'a str, consumer_tag: &'a str) -> BrokerFuture<'a, DeliveryStream>;

    /// Resolve once the session fails or closes.
    fn closed(&self) -> Pin<Box<dyn Future<Output = SessionEvent> + Send + 'static>>;

    /// Close the channel and then the connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SessionClosed`] if the close handshake fails.
    fn close(&self) -> BrokerFuture<'_, ()>;
}
