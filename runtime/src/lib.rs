//! # Certgate Runtime
//!
//! Stateful half of the certificate gateway: broker connection lifecycle,
//! correlation bookkeeping and timeout handling.
//!
//! ## Core Components
//!
//! - **BrokerConnectionManager**: owns the broker session, declares the queue
//!   topology and reconnects with exponential backoff
//! - **CorrelationRegistry**: pending requests keyed by correlation token,
//!   each completed exactly once
//! - **ReplyConsumer**: drains the reply queue into the registry
//! - **TimeoutReaper**: periodic backstop for expired requests
//! - **RequestGateway**: validates, publishes and awaits one request
//! - **HealthReporter**: read-only snapshot of the above
//! - **GatewayService**: owns all of them with a `start`/`stop` lifecycle
//!
//! ## Example
//!
//! ```ignore
//! use certgate_runtime::{GatewayConfig, GatewayService};
//!
//! let service = GatewayService::new(transport, GatewayConfig::default());
//! service.start().await;
//!
//! let certificate = service.submit("12345678900", "Ana").await?;
//!
//! service.stop().await;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

pub mod connection;
pub mod consumer;
pub mod gateway;
pub mod health;
pub mod reaper;
pub mod registry;
pub mod service;

pub use connection::{ActiveSession, BrokerConnectionManager, ConnectionState, Topology};
pub use consumer::{ReplyConsumer, ReplyDisposition};
pub use gateway::RequestGateway;
pub use health::{HealthReporter, HealthSnapshot, HealthStatus};
pub use reaper::TimeoutReaper;
pub use registry::{CorrelationRegistry, Outcome, RegistryError, ResponseHandle, ResponseSink};
pub use retry::{BackoffPolicy, retry_with_backoff};
pub use service::{GatewayConfig, GatewayService};
