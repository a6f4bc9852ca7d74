//! HTTP serving with gateway-aware graceful shutdown.
//!
//! On the shutdown signal the gateway is stopped first, so requests still
//! waiting on the broker are answered with `503` instead of holding the
//! server open until their own timeout. Draining the remaining connections is
//! bounded by the shutdown timeout, counted from the signal.

use axum::Router;
use certgate_runtime::{ConnectionState, GatewayService};
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Serve `app` until `signal` resolves, then stop `service` and drain.
///
/// # Errors
///
/// Returns the I/O error that ended the server early.
pub async fn serve_until<S>(
    listener: TcpListener,
    app: Router,
    service: Arc<GatewayService>,
    shutdown_timeout: Duration,
    signal: S,
) -> std::io::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
    let graceful = {
        let service = Arc::clone(&service);
        async move {
            signal.await;
            let _ = signalled_tx.send(());
            service.stop().await;
        }
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(graceful).into_future();
    tokio::pin!(server);

    let deadline = async move {
        if signalled_rx.await.is_err() {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(shutdown_timeout).await;
    };

    let served = tokio::select! {
        served = &mut server => served,
        () = deadline => {
            tracing::warn!(
                timeout_secs = shutdown_timeout.as_secs(),
                "Connections still open at shutdown timeout, closing"
            );
            Ok(())
        },
    };

    if service.connection().state() != ConnectionState::Closing {
        service.stop().await;
    }
    served
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use certgate_runtime::GatewayConfig;
    use certgate_testing::InMemoryBroker;
    use certgate_web::{AppState, build_router};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn shutdown_answers_waiting_callers_with_503() {
        let broker = InMemoryBroker::new();
        let service = Arc::new(GatewayService::new(
            Arc::new(broker.clone()),
            GatewayConfig::default(),
        ));
        service.start().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(AppState::new(Arc::clone(&service)));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_until(
            listener,
            app,
            Arc::clone(&service),
            Duration::from_secs(10),
            async move {
                let _ = stop_rx.await;
            },
        ));

        let body = r#"{"cpf":"123","nome":"Ana"}"#;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "POST /solicitar-certificado HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        broker.wait_for_published(1).await;

        stop_tx.send(()).unwrap();

        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
            .await
            .expect("waiting caller must be answered at shutdown")
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 503"), "{response}");

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server must exit after shutdown")
            .unwrap()
            .unwrap();
        assert!(service.registry().is_empty());
        assert_eq!(service.connection().state(), ConnectionState::Closing);
    }
}
