//! # Certgate Core
//!
//! Core traits and types for the certgate request/reply gateway.
//!
//! The gateway accepts a synchronous HTTP call, hands the work to an external
//! worker through a durable broker queue, and routes the worker's reply back to
//! the caller that is still waiting for it. This crate holds the pieces that
//! every other crate agrees on and that perform no I/O:
//!
//! - [`token::CorrelationToken`]: links one published request to its reply
//! - [`message`]: the JSON request/reply bodies exchanged with the worker
//! - [`broker`]: the transport abstraction (`BrokerTransport`, `BrokerSession`)
//! - [`error::GatewayError`]: the terminal failure taxonomy seen by callers
//! - [`environment::Clock`]: injected wall-clock time
//!
//! ## Message Flow
//!
//! ```text
//! HTTP caller ──► RequestGateway ──publish──► request queue ──► worker
//!      ▲                │                                         │
//!      │          CorrelationRegistry ◄── ReplyConsumer ◄── reply queue
//!      └────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod error;
pub mod message;
pub mod token;

// Re-export commonly used types
pub use broker::{BrokerError, BrokerSession, BrokerTransport};
pub use error::GatewayError;
pub use message::{CertificateRequest, ReplyPayload};
pub use token::CorrelationToken;

/// Environment module - Dependency injection traits
///
/// External time is abstracted behind a trait and injected, so request
/// timestamps are deterministic in tests.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use certgate_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// assert!(clock.now().timestamp_millis() > 0);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
