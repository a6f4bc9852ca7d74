//! Connection lifecycle: single-flight connect, topology, backoff and recovery.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use certgate_core::broker::MessageProperties;
use certgate_core::broker::QueueSpec;
use certgate_core::{BrokerError, BrokerSession, BrokerTransport, GatewayError};
use certgate_runtime::{
    BackoffPolicy, BrokerConnectionManager, ConnectionState, CorrelationRegistry, GatewayConfig, GatewayService,
    HealthStatus, Topology,
};
use certgate_testing::InMemoryBroker;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};

fn policy(max_retries: u32) -> BackoffPolicy {
    BackoffPolicy::builder()
        .max_retries(max_retries)
        .initial_delay(Duration::from_secs(1))
        .max_delay(Duration::from_secs(60))
        .build()
}

fn manager(broker: &InMemoryBroker, max_retries: u32) -> BrokerConnectionManager {
    BrokerConnectionManager::new(
        Arc::new(broker.clone()),
        Topology::default(),
        policy(max_retries),
        Duration::from_secs(5),
        CorrelationRegistry::new(Duration::from_secs(30)),
    )
}

fn service(broker: &InMemoryBroker) -> GatewayService {
    GatewayService::new(
        Arc::new(broker.clone()),
        GatewayConfig {
            backoff: policy(20),
            ..GatewayConfig::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_attempt() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker, 20);

    let results = futures::future::join_all((0..10).map(|_| manager.connect())).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.connections(), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn connect_resets_request_queue_and_purges_stale_replies() {
    let broker = InMemoryBroker::new();
    {
        let seed = broker.connect().await.unwrap();
        seed.declare_queue(&QueueSpec::request_queue("consulta_certificados", 1))
            .await
            .unwrap();
        seed.declare_queue(&QueueSpec::reply_queue("api_response_queue"))
            .await
            .unwrap();
        seed.close().await.unwrap();
    }
    broker.deliver("api_response_queue", MessageProperties::default(), b"{}".to_vec());

    let manager = manager(&broker, 20);
    manager.connect().await.unwrap();

    assert_eq!(broker.deleted_queues(), vec!["consulta_certificados".to_string()]);
    let request = broker.queue_spec("consulta_certificados").unwrap();
    assert!(request.durable);
    assert_eq!(request.message_ttl_ms, Some(1_800_000));
    let reply = broker.queue_spec("api_response_queue").unwrap();
    assert!(reply.durable && !reply.exclusive && !reply.auto_delete);

    // The stale reply was purged, never delivered.
    sleep(Duration::from_millis(1)).await;
    assert_eq!(broker.ready_count("api_response_queue"), 0);
    assert_eq!(broker.acks(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_connects_back_off_exponentially() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let manager = manager(&broker, 20);
    let start = Instant::now();

    assert!(manager.connect().await.is_err());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.retries(), 1);

    // Attempts at t = 0, 1, 3, 7 seconds.
    for (at_ms, attempts) in [(500, 1), (1_500, 2), (2_900, 2), (3_100, 3), (6_900, 3), (7_100, 4)] {
        sleep_until_ms(start, at_ms).await;
        assert_eq!(broker.connect_attempts(), attempts, "at {at_ms} ms");
    }
    assert_eq!(manager.retries(), 4);
}

#[tokio::test(start_paused = true)]
async fn hung_handshake_fails_after_connect_timeout_and_backs_off() {
    let broker = InMemoryBroker::new();
    broker.hang_next_connects(1);
    let manager = manager(&broker, 20);
    let start = Instant::now();

    let result = manager.connect().await;

    assert!(matches!(result, Err(BrokerError::ConnectionFailed(_))));
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert!(start.elapsed() < Duration::from_secs(6));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.retries(), 1);

    // Backoff retry one second later reaches a responsive broker.
    sleep_until_ms(start, 6_100).await;
    assert!(manager.is_available());
    assert_eq!(broker.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn retry_counter_resets_at_max_but_reconnection_continues() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let manager = manager(&broker, 3);
    let start = Instant::now();

    assert!(manager.connect().await.is_err());

    // Retries 1, 2 then 3 hits the max: fatal log and reset, next delay 4 s.
    sleep_until_ms(start, 3_500).await;
    assert_eq!(broker.connect_attempts(), 3);
    assert_eq!(manager.retries(), 0);

    sleep_until_ms(start, 8_500).await;
    assert_eq!(broker.connect_attempts(), 5);
    assert_eq!(manager.retries(), 2);
    assert!(!manager.is_available());
}

#[tokio::test(start_paused = true)]
async fn recovers_once_the_broker_comes_back() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let service = service(&broker);
    service.start().await;
    assert_eq!(service.health().status, HealthStatus::Disconnected);

    broker.set_reachable(true);
    sleep(Duration::from_millis(1_100)).await;

    let health = service.health();
    assert_eq!(health.status, HealthStatus::Ok);
    assert!(health.broker_connected);
    assert_eq!(health.connection_retries, 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_is_replaced_in_the_background() {
    let broker = InMemoryBroker::new();
    let service = service(&broker);
    service.start().await;
    assert!(service.connection().is_available());

    assert!(broker.drop_connection());
    sleep(Duration::from_millis(10)).await;

    let health = service.health();
    assert_eq!(health.status, HealthStatus::Disconnected);
    assert_eq!(health.connection_retries, 1);

    sleep(Duration::from_secs(1)).await;
    assert!(service.connection().is_available());
    assert_eq!(broker.connections(), 2);
    assert_eq!(service.health().connection_retries, 0);
}

#[tokio::test(start_paused = true)]
async fn submit_during_outage_reconnects_on_demand() {
    let broker = InMemoryBroker::new();
    let service = Arc::new(service(&broker));
    service.start().await;

    broker.drop_connection();
    sleep(Duration::from_millis(10)).await;
    assert!(!service.connection().is_available());

    let call = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.submit("123", "Ana").await })
    };
    let request = broker.wait_for_published(1).await.remove(0);
    broker.reply(&request, &serde_json::json!({"error": "Certificado não encontrado"}));

    assert!(call.await.unwrap().is_ok());
    assert_eq!(broker.connections(), 2);
}

#[tokio::test(start_paused = true)]
async fn no_reconnection_after_stop() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let service = service(&broker);
    service.start().await;

    service.stop().await;
    let attempts = broker.connect_attempts();
    sleep(Duration::from_secs(120)).await;

    assert_eq!(broker.connect_attempts(), attempts);
    assert_eq!(service.connection().state(), ConnectionState::Closing);
    assert!(matches!(
        service.submit("123", "Ana").await,
        Err(GatewayError::ServiceUnavailable(_))
    ));
}

async fn sleep_until_ms(start: Instant, at_ms: u64) {
    tokio::time::sleep_until(start + Duration::from_millis(at_ms)).await;
}
