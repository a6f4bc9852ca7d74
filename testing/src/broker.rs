//! In-memory broker implementing [`BrokerTransport`] and [`BrokerSession`].
//!
//! Queues, consumers and acknowledgements live in process memory. Tests play
//! the worker: they read what the gateway published with
//! [`InMemoryBroker::wait_for_published`] and answer with
//! [`InMemoryBroker::reply`]. Faults are injected through toggles.

use certgate_core::broker::{
    Acknowledger, BrokerFuture, Delivery, DeliveryStream, MessageProperties, QueueSpec, SessionEvent,
};
use certgate_core::{BrokerError, BrokerSession, BrokerTransport, CorrelationToken};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, mpsc, watch};

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

/// A message the gateway published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Target queue.
    pub queue: String,
    /// Raw body.
    pub body: Vec<u8>,
    /// Properties as published.
    pub properties: MessageProperties,
}

impl PublishedMessage {
    /// Body parsed as JSON; `Null` if it is not JSON.
    #[must_use]
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }

    /// Correlation token, if present and well-formed.
    #[must_use]
    pub fn token(&self) -> Option<CorrelationToken> {
        self.properties.correlation_id.as_deref()?.parse().ok()
    }
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<(MessageProperties, Vec<u8>)>,
    consumer: Option<(u64, DeliverySender)>,
}

struct BrokerState {
    reachable: bool,
    fail_connects: usize,
    fail_publishes: usize,
    hang_connects: usize,
    stall_publishes: bool,
    connect_attempts: usize,
    connections: usize,
    next_session: u64,
    current: Option<Arc<SessionHandle>>,
    queues: HashMap<String, QueueState>,
    deleted: Vec<String>,
    published: Vec<PublishedMessage>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    acks: Arc<AtomicUsize>,
    published_notify: Notify,
}

struct SessionHandle {
    id: u64,
    open: AtomicBool,
    events: watch::Sender<Option<SessionEvent>>,
}

impl SessionHandle {
    fn shut(&self, event: SessionEvent) -> bool {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        if was_open {
            self.events.send_replace(Some(event));
        }
        was_open
    }
}

/// Shared in-memory broker. Clones observe the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a reachable broker with no queues.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState {
                    reachable: true,
                    fail_connects: 0,
                    fail_publishes: 0,
                    hang_connects: 0,
                    stall_publishes: false,
                    connect_attempts: 0,
                    connections: 0,
                    next_session: 0,
                    current: None,
                    queues: HashMap::new(),
                    deleted: Vec::new(),
                    published: Vec::new(),
                }),
                acks: Arc::new(AtomicUsize::new(0)),
                published_notify: Notify::new(),
            }),
        }
    }

    /// Make `connect` and `probe` succeed or fail. Does not touch open sessions.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Fail the next `count` connection attempts even while reachable.
    pub fn fail_next_connects(&self, count: usize) {
        self.lock().fail_connects = count;
    }

    /// Fail the next `count` publishes.
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().fail_publishes = count;
    }

    /// Leave the next `count` connection attempts hanging forever, as a
    /// broker that accepts TCP but never completes the handshake.
    pub fn hang_next_connects(&self, count: usize) {
        self.lock().hang_connects = count;
    }

    /// Make publishes never complete (flow control that never lifts).
    pub fn stall_publishes(&self, stalled: bool) {
        self.lock().stall_publishes = stalled;
    }

    /// Kill the current session as a network fault would: it reports
    /// `SessionEvent::Error` and its consumers' streams end.
    ///
    /// Returns `false` if there was no open session.
    pub fn drop_connection(&self) -> bool {
        self.shut_current(SessionEvent::Error("connection reset by peer".to_string()))
    }

    /// Connection attempts so far, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Sessions successfully opened so far.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    /// True if the most recent session is still open.
    #[must_use]
    pub fn has_open_session(&self) -> bool {
        self.lock()
            .current
            .as_ref()
            .is_some_and(|session| session.open.load(Ordering::SeqCst))
    }

    /// Acknowledged deliveries across all sessions.
    #[must_use]
    pub fn acks(&self) -> usize {
        self.inner.acks.load(Ordering::SeqCst)
    }

    /// Everything published so far, oldest first.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Declared spec of `queue`, if it exists.
    #[must_use]
    pub fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.lock().queues.get(queue).map(|q| q.spec.clone())
    }

    /// Messages sitting in `queue` with no consumer to take them.
    #[must_use]
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Queues deleted so far, in order.
    #[must_use]
    pub fn deleted_queues(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    /// Wait until at least `count` messages have been published.
    pub async fn wait_for_published(&self, count: usize) -> Vec<PublishedMessage> {
        loop {
            let notified = self.inner.published_notify.notified();
            {
                let state = self.lock();
                if state.published.len() >= count {
                    return state.published.clone();
                }
            }
            notified.await;
        }
    }

    /// Answer `request` as the worker would: publish `body` to its `reply_to`
    /// with its correlation id.
    pub fn reply(&self, request: &PublishedMessage, body: &serde_json::Value) {
        let queue = request.properties.reply_to.clone().unwrap_or_default();
        let properties = MessageProperties {
            correlation_id: request.properties.correlation_id.clone(),
            content_type: Some("application/json".to_string()),
            ..MessageProperties::default()
        };
        self.deliver(&queue, properties, body.to_string().into_bytes());
    }

    /// Put a raw message on `queue` as an outside producer.
    ///
    /// Messages to undeclared queues are dropped, as with the default exchange.
    pub fn deliver(&self, queue: &str, properties: MessageProperties, body: Vec<u8>) {
        let mut state = self.lock();
        let Some(target) = state.queues.get_mut(queue) else {
            return;
        };

        if let Some((_, consumer)) = &target.consumer {
            let delivery = Delivery::new(
                properties.clone(),
                body.clone(),
                Box::new(MemoryAck(Arc::clone(&self.inner.acks))),
            );
            if consumer.send(Ok(delivery)).is_ok() {
                return;
            }
            target.consumer = None;
        }
        target.ready.push_back((properties, body));
    }

    fn shut_current(&self, event: SessionEvent) -> bool {
        let mut state = self.lock();
        let Some(session) = state.current.clone() else {
            return false;
        };
        if !session.shut(event) {
            return false;
        }
        for queue in state.queues.values_mut() {
            if queue.consumer.as_ref().is_some_and(|(owner, _)| *owner == session.id) {
                queue.consumer = None;
            }
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BrokerTransport for InMemoryBroker {
    fn probe(&self) -> BrokerFuture<'_, ()> {
        let reachable = self.lock().reachable;
        Box::pin(async move {
            if reachable {
                Ok(())
            } else {
                Err(BrokerError::ConnectionFailed("connection refused".to_string()))
            }
        })
    }

    fn connect(&self) -> BrokerFuture<'_, Arc<dyn BrokerSession>> {
        Box::pin(async move {
            let hang = {
                let mut state = self.lock();
                state.connect_attempts += 1;
                let hang = state.reachable && state.hang_connects > 0;
                if hang {
                    state.hang_connects -= 1;
                }
                hang
            };
            if hang {
                std::future::pending::<()>().await;
            }

            let mut state = self.lock();

            if !state.reachable {
                return Err(BrokerError::ConnectionFailed("connection refused".to_string()));
            }
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(BrokerError::ConnectionFailed("injected connect failure".to_string()));
            }

            state.next_session += 1;
            state.connections += 1;
            let (events, _) = watch::channel(None);
            let handle = Arc::new(SessionHandle {
                id: state.next_session,
                open: AtomicBool::new(true),
                events,
            });
            state.current = Some(Arc::clone(&handle));

            let session: Arc<dyn BrokerSession> = Arc::new(InMemorySession {
                broker: self.clone(),
                handle,
            });
            Ok(session)
        })
    }
}

struct InMemorySession {
    broker: InMemoryBroker,
    handle: Arc<SessionHandle>,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.handle.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::SessionClosed("channel closed".to_string()))
        }
    }
}

impl BrokerSession for InMemorySession {
    fn is_open(&self) -> bool {
        self.handle.open.load(Ordering::SeqCst)
    }

    fn delete_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.lock();
            if state.queues.remove(name).is_some() {
                state.deleted.push(name.to_string());
            }
            Ok(())
        })
    }

    fn declare_queue<'a>(&'a self, spec: &'a QueueSpec) -> BrokerFuture<'a, String> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.lock();
            state.queues.entry(spec.name.clone()).or_insert_with(|| QueueState {
                spec: spec.clone(),
                ready: VecDeque::new(),
                consumer: None,
            });
            Ok(spec.name.clone())
        })
    }

    fn purge_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, u32> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.lock();
            let queue = state.queues.get_mut(name).ok_or_else(|| BrokerError::QueueOperation {
                operation: "purge",
                queue: name.to_string(),
                reason: "NOT_FOUND".to_string(),
            })?;
            let purged = u32::try_from(queue.ready.len()).unwrap_or(u32::MAX);
            queue.ready.clear();
            Ok(purged)
        })
    }

    fn publish<'a>(
        &'a self,
        queue: &'a str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let stalled = self.broker.lock().stall_publishes;
            if stalled {
                std::future::pending::<()>().await;
            }
            {
                let mut state = self.broker.lock();
                if state.fail_publishes > 0 {
                    state.fail_publishes -= 1;
                    return Err(BrokerError::PublishFailed {
                        queue: queue.to_string(),
                        reason: "injected publish failure".to_string(),
                    });
                }
                state.published.push(PublishedMessage {
                    queue: queue.to_string(),
                    body: body.clone(),
                    properties: properties.clone(),
                });
            }
            self.broker.deliver(queue, properties, body);
            self.broker.inner.published_notify.notify_waiters();
            Ok(())
        })
    }

    fn consume<'a>(&'a self, queue: &'a str, _consumer_tag: &'a str) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move {
            self.ensure_open()?;
            let (tx, mut rx) = mpsc::unbounded_channel();
            {
                let mut state = self.broker.lock();
                let target = state.queues.get_mut(queue).ok_or_else(|| BrokerError::ConsumeFailed {
                    queue: queue.to_string(),
                    reason: "NOT_FOUND".to_string(),
                })?;
                for (properties, body) in target.ready.drain(..) {
                    let delivery =
                        Delivery::new(properties, body, Box::new(MemoryAck(Arc::clone(&self.broker.inner.acks))));
                    // The receiver is still in scope; sending cannot fail.
                    let _ = tx.send(Ok(delivery));
                }
                target.consumer = Some((self.handle.id, tx));
            }

            let stream: DeliveryStream = Box::pin(async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            });
            Ok(stream)
        })
    }

    fn closed(&self) -> Pin<Box<dyn Future<Output = SessionEvent> + Send + 'static>> {
        let mut events = self.handle.events.subscribe();
        Box::pin(async move {
            loop {
                let current = events.borrow_and_update().clone();
                if let Some(event) = current {
                    return event;
                }
                if events.changed().await.is_err() {
                    return SessionEvent::Closed;
                }
            }
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if self.handle.shut(SessionEvent::Closed) {
                let mut state = self.broker.lock();
                for queue in state.queues.values_mut() {
                    if queue.consumer.as_ref().is_some_and(|(owner, _)| *owner == self.handle.id) {
                        queue.consumer = None;
                    }
                }
            }
            Ok(())
        })
    }
}

struct MemoryAck(Arc<AtomicUsize>);

impl Acknowledger for MemoryAck {
    fn ack(self: Box<Self>) -> BrokerFuture<'static, ()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn published_messages_reach_the_consumer_and_count_acks() {
        let broker = InMemoryBroker::new();
        let session = broker.connect().await.unwrap();
        session.declare_queue(&QueueSpec::reply_queue("replies")).await.unwrap();
        let mut stream = session.consume("replies", "test").await.unwrap();

        session
            .publish("replies", b"{}".to_vec(), MessageProperties::default())
            .await
            .unwrap();

        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"{}");
        delivery.ack().await.unwrap();
        assert_eq!(broker.acks(), 1);
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);

        assert!(broker.probe().await.is_err());
        assert!(broker.connect().await.is_err());
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.connections(), 0);
    }

    #[tokio::test]
    async fn dropped_connection_reports_error_and_ends_stream() {
        let broker = InMemoryBroker::new();
        let session = broker.connect().await.unwrap();
        session.declare_queue(&QueueSpec::reply_queue("replies")).await.unwrap();
        let mut stream = session.consume("replies", "test").await.unwrap();
        let closed = session.closed();

        assert!(broker.drop_connection());

        assert!(!session.is_open());
        assert!(matches!(closed.await, SessionEvent::Error(_)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_connect_never_completes_and_counts_as_attempt() {
        let broker = InMemoryBroker::new();
        broker.hang_next_connects(1);

        let attempt = tokio::time::timeout(std::time::Duration::from_secs(60), broker.connect()).await;

        assert!(attempt.is_err());
        assert_eq!(broker.connect_attempts(), 1);
        assert!(broker.connect().await.is_ok());
    }

    #[tokio::test]
    async fn purge_drops_waiting_messages() {
        let broker = InMemoryBroker::new();
        let session = broker.connect().await.unwrap();
        session.declare_queue(&QueueSpec::reply_queue("replies")).await.unwrap();
        broker.deliver("replies", MessageProperties::default(), b"stale".to_vec());
        broker.deliver("replies", MessageProperties::default(), b"stale".to_vec());

        assert_eq!(session.purge_queue("replies").await.unwrap(), 2);
        assert_eq!(broker.ready_count("replies"), 0);
    }
}
