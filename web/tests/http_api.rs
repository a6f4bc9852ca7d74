//! HTTP contract of the gateway, driven through axum-test.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use axum::http::{HeaderValue, StatusCode, header};
use axum_test::TestServer;
use certgate_runtime::{GatewayConfig, GatewayService};
use certgate_testing::{InMemoryBroker, test_clock};
use certgate_web::{AppState, build_router};
use serde_json::{Value, json};
use std::sync::Arc;

async fn server(broker: &InMemoryBroker) -> (TestServer, Arc<GatewayService>) {
    let service = Arc::new(GatewayService::with_clock(
        Arc::new(broker.clone()),
        GatewayConfig::default(),
        Arc::new(test_clock()),
    ));
    service.start().await;
    let server = TestServer::new(build_router(AppState::new(Arc::clone(&service)))).unwrap();
    (server, service)
}

#[tokio::test(start_paused = true)]
async fn certificate_reply_is_returned_as_is() {
    let broker = InMemoryBroker::new();
    let (server, _service) = server(&broker).await;

    let call = async {
        server
            .post("/solicitar-certificado")
            .json(&json!({"cpf": "123", "nome": "Ana"}))
            .await
    };
    let worker = async {
        let request = broker.wait_for_published(1).await.remove(0);
        broker.reply(
            &request,
            &json!({"nome": "Ana", "cpf": "123", "data_conclusao": "2024-01-01", "nota": 9.5}),
        );
    };
    let (response, ()) = tokio::join!(call, worker);

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(
        response.json::<Value>(),
        json!({"nome": "Ana", "cpf": "123", "data_conclusao": "2024-01-01", "nota": 9.5})
    );
}

#[tokio::test(start_paused = true)]
async fn not_found_reply_is_still_200() {
    let broker = InMemoryBroker::new();
    let (server, _service) = server(&broker).await;

    let call = async {
        server
            .post("/solicitar-certificado")
            .json(&json!({"cpf": "000", "nome": "Ninguém"}))
            .await
    };
    let worker = async {
        let request = broker.wait_for_published(1).await.remove(0);
        broker.reply(&request, &json!({"error": "Certificado não encontrado"}));
    };
    let (response, ()) = tokio::join!(call, worker);

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>(), json!({"error": "Certificado não encontrado"}));
}

#[tokio::test(start_paused = true)]
async fn missing_fields_are_rejected() {
    let broker = InMemoryBroker::new();
    let (server, _service) = server(&broker).await;

    for body in [json!({"cpf": "123"}), json!({"nome": "Ana"}), json!({"cpf": "", "nome": "Ana"})] {
        let response = server.post("/solicitar-certificado").json(&body).await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.json::<Value>(),
            json!({"error": "CPF e nome são obrigatórios", "code": "VALIDATION_ERROR"})
        );
    }

    let garbage = server.post("/solicitar-certificado").text("cpf=123").await;
    assert_eq!(garbage.status_code(), StatusCode::BAD_REQUEST);
    assert!(broker.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn broker_outage_maps_to_503() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);
    let (server, _service) = server(&broker).await;

    let response = server
        .post("/solicitar-certificado")
        .json(&json!({"cpf": "123", "nome": "Ana"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json::<Value>()["code"], "SERVICE_UNAVAILABLE");

    let health = server.get("/health").await;
    assert_eq!(health.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let body = health.json::<Value>();
    assert_eq!(body["status"], "Disconnected");
    assert_eq!(body["brokerConnected"], false);
    assert_eq!(body["connectionRetries"], 1);
}

#[tokio::test(start_paused = true)]
async fn silent_worker_maps_to_504() {
    let broker = InMemoryBroker::new();
    let (server, service) = server(&broker).await;

    let response = server
        .post("/solicitar-certificado")
        .json(&json!({"cpf": "123", "nome": "Ana"}))
        .await;

    assert_eq!(response.status_code(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(
        response.json::<Value>(),
        json!({"error": "Tempo limite excedido ao aguardar resposta do serviço.", "code": "TIMEOUT"})
    );
    assert!(service.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn healthy_gateway_reports_ok() {
    let broker = InMemoryBroker::new();
    let (server, _service) = server(&broker).await;

    let response = server.get("/health").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body = response.json::<Value>();
    assert_eq!(body["status"], "OK");
    assert_eq!(body["brokerConnected"], true);
    assert_eq!(body["pendingRequests"], 0);
    assert_eq!(body["connectionRetries"], 0);
    assert!(body["uptime"].is_number());
}

#[tokio::test(start_paused = true)]
async fn metrics_are_404_when_disabled() {
    let broker = InMemoryBroker::new();
    let (server, _service) = server(&broker).await;

    let response = server.get("/metrics").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn cross_origin_requests_are_allowed() {
    let broker = InMemoryBroker::new();
    let (server, _service) = server(&broker).await;

    let response = server
        .get("/health")
        .add_header(header::ORIGIN, HeaderValue::from_static("http://form.local"))
        .await;

    assert_eq!(response.header(header::ACCESS_CONTROL_ALLOW_ORIGIN), "*");
}
