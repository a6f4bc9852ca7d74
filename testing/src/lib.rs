//! # Certgate Testing
//!
//! Test doubles for the certgate gateway.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: a broker transport with fault injection
//! - [`FixedClock`]: deterministic time
//!
//! ## Example
//!
//! ```ignore
//! use certgate_testing::InMemoryBroker;
//! use certgate_runtime::{GatewayConfig, GatewayService};
//!
//! #[tokio::test(start_paused = true)]
//! async fn answers_from_the_worker() {
//!     let broker = InMemoryBroker::new();
//!     let service = GatewayService::new(Arc::new(broker.clone()), GatewayConfig::default());
//!     service.start().await;
//!
//!     let call = tokio::spawn(async move { service.submit("123", "Ana").await });
//!     let request = broker.wait_for_published(1).await.remove(0);
//!     broker.reply(&request, &json!({"error": "Certificado não encontrado"}));
//!
//!     assert!(call.await.unwrap().is_ok());
//! }
//! ```

use certgate_core::environment::Clock;
use chrono::{DateTime, Utc};

pub mod broker;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making request timestamps reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use certgate_testing::mocks::FixedClock;
    /// use certgate_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Fixed clock at 2025-01-01 00:00:00 UTC (1735689600000 ms).
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp_millis(1_735_689_600_000).unwrap_or_default())
    }
}

pub use broker::{InMemoryBroker, PublishedMessage};
pub use mocks::{FixedClock, test_clock};
