//! Broker connection lifecycle.
//!
//! [`BrokerConnectionManager`] owns the single broker session (connection plus
//! channel), the queue topology declared on it and the reply consumer reading
//! from it. Sessions are replaced wholesale on reconnect; readers always fetch
//! the current one through [`BrokerConnectionManager::active_session`].
//!
//! # States
//!
//! ```text
//!              connect()                  session ready
//! Disconnected ─────────► Connecting ───────────────────► Connected
//!      ▲                      │ failure                       │ error / close
//!      └──────────────────────┴───────── backoff ◄────────────┘
//!
//! any state ── stop() ──► Closing
//! ```
//!
//! # Concurrency
//!
//! At most one connection attempt runs at a time. The first caller of
//! [`connect`](BrokerConnectionManager::connect) spawns the attempt and stores
//! a shared future for it before anything is awaited; concurrent callers await
//! that same future and observe the same result. Failures and unexpected
//! closures schedule [`reconnect_with_backoff`](BrokerConnectionManager::reconnect_with_backoff),
//! of which at most one is pending at a time.

use crate::consumer::ReplyConsumer;
use crate::metrics::BrokerMetrics;
use crate::registry::CorrelationRegistry;
use crate::retry::BackoffPolicy;
use certgate_core::broker::{DeliveryStream, QueueSpec, SessionEvent};
use certgate_core::{BrokerError, BrokerSession, BrokerTransport};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No usable session.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Session open, topology declared, reply consumer running.
    Connected,
    /// Shutting down; no further connection attempts.
    Closing,
}

/// Queue names and consumer settings declared on every new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Queue the worker consumes requests from.
    pub request_queue: String,
    /// `x-message-ttl` of the request queue in milliseconds.
    pub request_queue_ttl_ms: u32,
    /// Queue the worker publishes replies to.
    pub reply_queue: String,
    /// Consumer tag used on the reply queue.
    pub consumer_tag: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            request_queue: "consulta_certificados".to_string(),
            request_queue_ttl_ms: 1_800_000,
            reply_queue: "api_response_queue".to_string(),
            consumer_tag: "certgate-reply-consumer".to_string(),
        }
    }
}

/// The current session and the reply queue name the broker confirmed.
#[derive(Clone)]
pub struct ActiveSession {
    /// Live session.
    pub session: Arc<dyn BrokerSession>,
    /// Reply queue as declared on this session.
    pub reply_queue: String,
}

type ConnectFuture = Shared<BoxFuture<'static, Result<(), BrokerError>>>;

struct ManagerState {
    phase: ConnectionState,
    active: Option<ActiveSession>,
    connecting: Option<ConnectFuture>,
    reconnect: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    generation: u64,
}

struct Inner {
    transport: Arc<dyn BrokerTransport>,
    topology: Topology,
    policy: BackoffPolicy,
    connect_timeout: Duration,
    registry: CorrelationRegistry,
    state: Mutex<ManagerState>,
    retries: AtomicU32,
}

/// Owns the broker session and keeps it alive.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct BrokerConnectionManager {
    inner: Arc<Inner>,
}

impl BrokerConnectionManager {
    /// Create a manager in the `Disconnected` state.
    ///
    /// Replies consumed on any session resolve into `registry`. Opening a
    /// session, topology included, fails after `connect_timeout`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        topology: Topology,
        policy: BackoffPolicy,
        connect_timeout: Duration,
        registry: CorrelationRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                topology,
                policy,
                connect_timeout,
                registry,
                state: Mutex::new(ManagerState {
                    phase: ConnectionState::Disconnected,
                    active: None,
                    connecting: None,
                    reconnect: None,
                    consumer: None,
                    watcher: None,
                    generation: 0,
                }),
                retries: AtomicU32::new(0),
            }),
        }
    }

    /// Establish a session, or join the attempt already in flight.
    ///
    /// Returns immediately when already connected. On failure a backoff
    /// reconnection is scheduled before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the [`BrokerError`] of the attempt, or
    /// [`BrokerError::ShuttingDown`] after [`stop`](Self::stop).
    pub async fn connect(&self) -> Result<(), BrokerError> {
        let attempt = {
            let mut state = self.lock();
            match state.phase {
                ConnectionState::Closing => return Err(BrokerError::ShuttingDown),
                ConnectionState::Connected if is_open(state.active.as_ref()) => return Ok(()),
                _ => {},
            }

            if let Some(attempt) = &state.connecting {
                attempt.clone()
            } else {
                state.phase = ConnectionState::Connecting;
                let manager = self.clone();
                let task = tokio::spawn(async move { manager.establish().await });
                let attempt: ConnectFuture = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(BrokerError::ConnectionFailed(format!("connect task failed: {e}")))
                    })
                }
                .boxed()
                .shared();
                state.connecting = Some(attempt.clone());
                attempt
            }
        };

        attempt.await
    }

    /// Schedule a [`connect`](Self::connect) after the next backoff delay.
    ///
    /// No-op while shutting down, while an attempt is in flight or while a
    /// reconnect is already scheduled. When the retry counter reaches the
    /// policy's `max_retries` a fatal-level message is logged and the counter
    /// resets; reconnection continues regardless.
    pub fn reconnect_with_backoff(&self) {
        let mut state = self.lock();
        if state.phase == ConnectionState::Closing
            || state.connecting.is_some()
            || state.reconnect.is_some()
        {
            return;
        }

        let attempt = self.inner.retries.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.inner.policy.delay_for_attempt(attempt);
        BrokerMetrics::record_reconnect_attempt();
        tracing::info!(
            attempt,
            max_retries = self.inner.policy.max_retries,
            delay_ms = delay.as_millis(),
            "Scheduling broker reconnection"
        );

        if attempt >= self.inner.policy.max_retries {
            tracing::error!(
                attempt,
                "FATAL: broker unreachable after max reconnection attempts; resetting counter and retrying"
            );
            self.inner.retries.store(0, Ordering::SeqCst);
        }

        let manager = self.clone();
        state.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.lock().reconnect = None;
            if let Err(e) = manager.connect().await {
                tracing::debug!(error = %e, "Scheduled reconnection failed");
            }
        }));
    }

    /// True iff a session exists and its connection and channel are open.
    #[must_use]
    pub fn is_available(&self) -> bool {
        let state = self.lock();
        state.phase == ConnectionState::Connected && is_open(state.active.as_ref())
    }

    /// The current session, if available.
    #[must_use]
    pub fn active_session(&self) -> Option<ActiveSession> {
        let state = self.lock();
        if state.phase == ConnectionState::Connected && is_open(state.active.as_ref()) {
            state.active.clone()
        } else {
            None
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lock().phase
    }

    /// Consecutive reconnection attempts since the last successful connect.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.inner.retries.load(Ordering::SeqCst)
    }

    /// Declared topology.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Enter `Closing`, cancel background work and close the session.
    ///
    /// Pending backoff timers, the session watcher and the reply consumer are
    /// aborted. An attempt still in flight closes its session on completion.
    pub async fn stop(&self) {
        let active = {
            let mut state = self.lock();
            state.phase = ConnectionState::Closing;
            state.connecting = None;
            for handle in [state.reconnect.take(), state.consumer.take(), state.watcher.take()]
                .into_iter()
                .flatten()
            {
                handle.abort();
            }
            state.active.take()
        };

        if let Some(active) = active {
            if let Err(e) = active.session.close().await {
                tracing::warn!(error = %e, "Error closing broker session");
            }
        }
        tracing::info!("Broker connection manager stopped");
    }

    async fn establish(&self) -> Result<(), BrokerError> {
        let timeout = self.inner.connect_timeout;
        let result = tokio::time::timeout(timeout, self.open_session())
            .await
            .unwrap_or_else(|_| {
                Err(BrokerError::ConnectionFailed(format!(
                    "no session after {}ms",
                    timeout.as_millis()
                )))
            });

        match result {
            Ok((active, deliveries)) => {
                let Some(rejected) = self.install(active, deliveries) else {
                    return Ok(());
                };
                if let Err(e) = rejected.session.close().await {
                    tracing::warn!(error = %e, "Error closing session opened during shutdown");
                }
                Err(BrokerError::ShuttingDown)
            },
            Err(e) => {
                let closing = {
                    let mut state = self.lock();
                    state.connecting = None;
                    let closing = state.phase == ConnectionState::Closing;
                    if !closing {
                        state.phase = ConnectionState::Disconnected;
                    }
                    closing
                };

                tracing::warn!(error = %e, "Failed to connect to broker");
                if !closing {
                    self.reconnect_with_backoff();
                }
                Err(e)
            },
        }
    }

    /// Make `active` the current session and start its consumer and watcher.
    ///
    /// Hands the session back when the manager is closing.
    fn install(&self, active: ActiveSession, deliveries: DeliveryStream) -> Option<ActiveSession> {
        let mut state = self.lock();
        state.connecting = None;
        if state.phase == ConnectionState::Closing {
            return Some(active);
        }

        state.generation += 1;
        state.phase = ConnectionState::Connected;
        state.consumer = Some(tokio::spawn(
            ReplyConsumer::new(self.inner.registry.clone()).run(deliveries),
        ));
        state.watcher = Some(tokio::spawn(
            self.clone().watch(Arc::clone(&active.session), state.generation),
        ));
        state.active = Some(active);
        self.inner.retries.store(0, Ordering::SeqCst);
        BrokerMetrics::record_connected();
        tracing::info!(generation = state.generation, "Connected to broker");
        None
    }

    async fn open_session(&self) -> Result<(ActiveSession, DeliveryStream), BrokerError> {
        let stale = {
            let mut state = self.lock();
            for handle in [state.consumer.take(), state.watcher.take()].into_iter().flatten() {
                handle.abort();
            }
            state.active.take()
        };
        if let Some(stale) = stale {
            if let Err(e) = stale.session.close().await {
                tracing::warn!(error = %e, "Error closing previous broker session");
            }
        }

        tracing::info!("Connecting to broker...");
        let session = self.inner.transport.connect().await?;

        match self.declare_topology(session.as_ref()).await {
            Ok((reply_queue, deliveries)) => Ok((ActiveSession { session, reply_queue }, deliveries)),
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    tracing::debug!(error = %close_err, "Error closing half-initialised session");
                }
                Err(e)
            },
        }
    }

    async fn declare_topology(&self, session: &dyn BrokerSession) -> Result<(String, DeliveryStream), BrokerError> {
        let topology = &self.inner.topology;

        // The gateway is the sole owner of the request queue; reset it on every session.
        match session.delete_queue(&topology.request_queue).await {
            Ok(()) => tracing::info!(queue = %topology.request_queue, "Request queue deleted"),
            Err(e) => tracing::warn!(
                queue = %topology.request_queue,
                error = %e,
                "Request queue not deleted, declaring anyway"
            ),
        }

        let request_spec = QueueSpec::request_queue(&topology.request_queue, topology.request_queue_ttl_ms);
        session.declare_queue(&request_spec).await?;

        let reply_spec = QueueSpec::reply_queue(&topology.reply_queue);
        let reply_queue = session.declare_queue(&reply_spec).await?;

        let purged = session.purge_queue(&reply_queue).await?;
        if purged > 0 {
            tracing::info!(queue = %reply_queue, purged, "Purged stale replies");
        }

        let deliveries = session.consume(&reply_queue, &topology.consumer_tag).await?;
        tracing::info!(
            request_queue = %topology.request_queue,
            reply_queue = %reply_queue,
            "Broker topology declared"
        );
        Ok((reply_queue, deliveries))
    }

    async fn watch(self, session: Arc<dyn BrokerSession>, generation: u64) {
        let event = session.closed().await;

        {
            let mut state = self.lock();
            if state.generation != generation || state.phase == ConnectionState::Closing {
                return;
            }
            state.phase = ConnectionState::Disconnected;
            state.watcher = None;
            if let Some(consumer) = state.consumer.take() {
                consumer.abort();
            }
        }

        match event {
            SessionEvent::Error(reason) => {
                tracing::error!(%reason, "Broker connection error, reconnecting");
            },
            SessionEvent::Closed => {
                tracing::warn!("Broker connection closed, reconnecting");
            },
        }
        self.reconnect_with_backoff();
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_open(active: Option<&ActiveSession>) -> bool {
    active.is_some_and(|active| active.session.is_open())
}
