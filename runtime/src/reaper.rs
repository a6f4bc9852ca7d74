//! Periodic sweep of expired requests.
//!
//! Each pending request already owns a timer; the reaper is the backstop that
//! catches anything a timer missed. It runs every `timeout / 2`.

use crate::registry::CorrelationRegistry;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Periodically expires requests older than the registry timeout.
#[derive(Debug, Clone)]
pub struct TimeoutReaper {
    registry: CorrelationRegistry,
    period: Duration,
}

impl TimeoutReaper {
    /// Create a reaper sweeping every `timeout / 2` (at least 1 ms).
    #[must_use]
    pub fn new(registry: CorrelationRegistry) -> Self {
        let period = (registry.timeout() / 2).max(Duration::from_millis(1));
        Self { registry, period }
    }

    /// Sweep interval.
    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Run one sweep now.
    pub fn sweep_once(&self) -> usize {
        let expired = self.registry.sweep(Instant::now());
        if expired > 0 {
            tracing::debug!(expired, remaining = self.registry.len(), "Reaper sweep finished");
        }
        expired
    }

    /// Spawn the sweep loop. Abort the returned handle to stop it.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::debug!(period_ms = self.period.as_millis(), "Timeout reaper started");
            loop {
                ticker.tick().await;
                self.sweep_once();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::registry::ResponseSink;
    use certgate_core::{CorrelationToken, GatewayError};

    #[test]
    fn period_is_half_the_timeout() {
        let registry = CorrelationRegistry::new(Duration::from_secs(30));
        assert_eq!(TimeoutReaper::new(registry).period(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_only_old_requests() {
        let registry = CorrelationRegistry::new(Duration::from_millis(100));
        let reaper = TimeoutReaper::new(registry.clone());

        let old = CorrelationToken::generate();
        let (sink, old_handle) = ResponseSink::channel();
        registry.register(old, sink).unwrap();

        tokio::time::advance(Duration::from_millis(60)).await;
        let fresh = CorrelationToken::generate();
        let (sink, _fresh_handle) = ResponseSink::channel();
        registry.register(fresh, sink).unwrap();

        // The per-request timer and the sweep race for `old`; either way it goes exactly once.
        tokio::time::advance(Duration::from_millis(45)).await;
        reaper.sweep_once();
        assert!(!registry.contains(&old));
        assert!(registry.contains(&fresh));
        assert_eq!(
            old_handle.outcome().await,
            Err(GatewayError::Timeout { timeout_ms: 100 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_can_be_aborted() {
        let registry = CorrelationRegistry::new(Duration::from_millis(100));
        let handle = TimeoutReaper::new(registry).spawn();
        tokio::time::sleep(Duration::from_millis(120)).await;

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
