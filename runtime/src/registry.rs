//! Correlation registry: pending requests keyed by token.
//!
//! Each pending request owns a single-use [`ResponseSink`] and an armed expiry
//! timer. A record leaves the map through exactly one of [`resolve`],
//! [`expire`], [`sweep`], [`discard`] or [`fail_all`]; whichever removes it
//! first owns the sink, and completing a sink consumes it. Racing paths that
//! find the record gone are no-ops, so a caller can never be answered twice.
//!
//! [`resolve`]: CorrelationRegistry::resolve
//! [`expire`]: CorrelationRegistry::expire
//! [`sweep`]: CorrelationRegistry::sweep
//! [`discard`]: CorrelationRegistry::discard
//! [`fail_all`]: CorrelationRegistry::fail_all

use crate::metrics::GatewayMetrics;
use certgate_core::{CorrelationToken, GatewayError, ReplyPayload};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Terminal result delivered to a waiting caller.
pub type Outcome = Result<ReplyPayload, GatewayError>;

/// Errors from registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A record with this token is already pending.
    #[error("duplicate correlation token {0}")]
    DuplicateToken(CorrelationToken),
}

/// Write side of a single-assignment result cell.
#[derive(Debug)]
pub struct ResponseSink(oneshot::Sender<Outcome>);

impl ResponseSink {
    /// Create a sink and the handle its outcome will be delivered to.
    #[must_use]
    pub fn channel() -> (Self, ResponseHandle) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), ResponseHandle(rx))
    }

    /// Deliver the outcome. Returns `false` if the caller already went away.
    fn complete(self, outcome: Outcome) -> bool {
        self.0.send(outcome).is_ok()
    }
}

/// Read side of a [`ResponseSink`].
#[derive(Debug)]
pub struct ResponseHandle(oneshot::Receiver<Outcome>);

impl ResponseHandle {
    /// Wait for the outcome.
    ///
    /// A sink dropped without being completed (its record was discarded)
    /// surfaces as [`GatewayError::Internal`].
    pub async fn outcome(self) -> Outcome {
        self.0
            .await
            .unwrap_or_else(|_| Err(GatewayError::Internal("response sink dropped".to_string())))
    }
}

struct PendingRequest {
    sink: ResponseSink,
    created_at: Instant,
    timer: AbortHandle,
}

struct RegistryInner {
    pending: Mutex<HashMap<CorrelationToken, PendingRequest>>,
    timeout: Duration,
}

/// Map from correlation token to pending request.
///
/// Cheap to clone; clones share the same map.
#[derive(Clone)]
pub struct CorrelationRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.len())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

impl CorrelationRegistry {
    /// Create an empty registry whose records expire after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                pending: Mutex::new(HashMap::new()),
                timeout,
            }),
        }
    }

    /// The request timeout records are armed with.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Number of pending records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when `token` is pending.
    #[must_use]
    pub fn contains(&self, token: &CorrelationToken) -> bool {
        self.lock().contains_key(token)
    }

    /// Insert a pending record and arm its expiry timer.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateToken`] if `token` is already pending;
    /// the existing record is left untouched.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime (the timer is a spawned task).
    pub fn register(&self, token: CorrelationToken, sink: ResponseSink) -> Result<(), RegistryError> {
        let mut pending = self.lock();
        if pending.contains_key(&token) {
            return Err(RegistryError::DuplicateToken(token));
        }

        let timer = spawn_timer(Arc::downgrade(&self.inner), token, self.inner.timeout);
        pending.insert(
            token,
            PendingRequest {
                sink,
                created_at: Instant::now(),
                timer,
            },
        );
        GatewayMetrics::record_pending(pending.len());
        Ok(())
    }

    /// Complete a pending record with the worker's reply.
    ///
    /// Returns `false` if no record matched (late or unknown reply).
    pub fn resolve(&self, token: &CorrelationToken, payload: ReplyPayload) -> bool {
        let Some(request) = self.take(token) else {
            return false;
        };

        let elapsed = request.created_at.elapsed();
        if !request.sink.complete(Ok(payload)) {
            tracing::debug!(correlation_id = %token, "Caller went away before reply arrived");
        }
        tracing::info!(
            correlation_id = %token,
            elapsed_ms = elapsed.as_millis(),
            "Reply delivered"
        );
        true
    }

    /// Complete a pending record with a timeout error.
    ///
    /// Returns `false` if the record was already resolved or expired.
    pub fn expire(&self, token: &CorrelationToken) -> bool {
        let Some(request) = self.take(token) else {
            return false;
        };

        tracing::warn!(correlation_id = %token, "Request timed out waiting for reply");
        request.sink.complete(Err(self.timeout_error()));
        true
    }

    /// Expire every record older than the timeout at `now`.
    ///
    /// Catches records whose own timer never fired. Returns how many expired.
    pub fn sweep(&self, now: Instant) -> usize {
        let timeout = self.inner.timeout;
        let expired: Vec<(CorrelationToken, PendingRequest)> = {
            let mut pending = self.lock();
            let stale: Vec<CorrelationToken> = pending
                .iter()
                .filter(|(_, request)| now.saturating_duration_since(request.created_at) > timeout)
                .map(|(token, _)| *token)
                .collect();
            let expired = stale
                .into_iter()
                .filter_map(|token| pending.remove(&token).map(|request| (token, request)))
                .collect();
            GatewayMetrics::record_pending(pending.len());
            expired
        };

        let count = expired.len();
        for (token, request) in expired {
            request.timer.abort();
            tracing::warn!(correlation_id = %token, "Sweep expired stale request");
            request.sink.complete(Err(self.timeout_error()));
        }

        if count > 0 {
            tracing::info!(expired = count, "Sweep removed expired pending requests");
        }
        count
    }

    /// Remove a record without completing its sink.
    ///
    /// Used when the request never left the gateway; the caller is answered
    /// directly instead.
    pub fn discard(&self, token: &CorrelationToken) -> bool {
        self.take(token).is_some()
    }

    /// Complete every pending record with `error`. Returns how many there were.
    pub fn fail_all(&self, error: &GatewayError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.lock();
            let drained = pending.drain().map(|(_, request)| request).collect();
            GatewayMetrics::record_pending(0);
            drained
        };

        let count = drained.len();
        for request in drained {
            request.timer.abort();
            request.sink.complete(Err(error.clone()));
        }
        count
    }

    fn take(&self, token: &CorrelationToken) -> Option<PendingRequest> {
        let request = {
            let mut pending = self.lock();
            let request = pending.remove(token);
            GatewayMetrics::record_pending(pending.len());
            request
        }?;
        request.timer.abort();
        Some(request)
    }

    fn timeout_error(&self) -> GatewayError {
        GatewayError::Timeout {
            timeout_ms: u64::try_from(self.inner.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationToken, PendingRequest>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn spawn_timer(registry: Weak<RegistryInner>, token: CorrelationToken, timeout: Duration) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(inner) = registry.upgrade() {
            CorrelationRegistry { inner }.expire(&token);
        }
    })
    .abort_handle()
}
