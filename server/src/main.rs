//! Certificate request gateway.
//!
//! Accepts certificate requests over HTTP, forwards them to the worker over
//! RabbitMQ and answers with the worker's reply.

use anyhow::Context;
use certgate_amqp::AmqpTransport;
use certgate_core::BrokerTransport;
use certgate_runtime::metrics::MetricsServer;
use certgate_runtime::{GatewayService, retry_with_backoff};
use certgate_server::Config;
use certgate_server::lifecycle::serve_until;
use certgate_web::{AppState, build_router};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "certgate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting certificate gateway");

    let config = Config::from_env();
    config.validate().context("invalid configuration")?;
    info!(
        broker_url = %config.broker.url,
        request_queue = %config.broker.request_queue,
        reply_queue = %config.broker.reply_queue,
        timeout_ms = config.requests.timeout_ms,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new();
    if config.server.metrics_enabled {
        if let Err(e) = metrics.start() {
            warn!(error = %e, "Metrics disabled");
        }
    }

    let transport = AmqpTransport::builder()
        .uri(&config.broker.url)
        .probe_address(&config.broker.host, config.broker.port)
        .build();

    info!(target = %transport.probe_target(), "Waiting for RabbitMQ");
    retry_with_backoff(&config.backoff(), || transport.probe())
        .await
        .context("RabbitMQ unreachable")?;
    info!("RabbitMQ reachable");

    let service = Arc::new(GatewayService::new(Arc::new(transport), config.gateway()));
    service.start().await;

    let mut state = AppState::new(Arc::clone(&service));
    if let Some(handle) = metrics.handle() {
        state = state.with_metrics(handle.clone());
    }
    let app = build_router(state);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(address = %addr, "HTTP server listening");

    let served = serve_until(
        listener,
        app,
        service,
        Duration::from_secs(config.server.shutdown_timeout),
        shutdown_signal(),
    )
    .await;

    if let Err(e) = served {
        error!(error = %e, "HTTP server failed");
        return Err(e.into());
    }

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
