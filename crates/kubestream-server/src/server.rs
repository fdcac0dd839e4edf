use std::net::SocketAddr;

use axum::Router;
use tokio_util::sync::CancellationToken;

/// Serve `app` on `listen` until `shutdown` is cancelled.
///
/// Upgraded WebSocket connections are not tracked by the graceful drain.
/// Open log sessions watch the same token; wait for them with
/// [`SessionSupervisor::wait_closed`](crate::SessionSupervisor::wait_closed)
/// after this returns.
pub async fn run_server(
    listen: SocketAddr,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!("kubestream listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("shutting down gracefully");
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[tokio::test]
    async fn test_server_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let app = Router::new().route("/health", get(|| async { "OK" }));
        let server = tokio::spawn(run_server("127.0.0.1:0".parse().unwrap(), app, shutdown.clone()));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let result = run_server(addr, Router::new(), CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
