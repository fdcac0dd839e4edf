use std::path::Path;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use kubestream_k8s::{Connector, Inventory, InventoryKind, InventoryQuery};
use kubestream_logs::TailEngine;
use kubestream_types::{ErrorFrame, SessionParams};

use crate::session::SessionSupervisor;
use crate::transport;

/// Build the application router: the log socket, the inventory API and,
/// when configured, the static front end.
pub fn router<E, K>(
    supervisor: Arc<SessionSupervisor<E, K>>,
    inventory: Arc<Inventory>,
    assets: Option<&Path>,
) -> Router
where
    E: TailEngine,
    K: Connector<Client = E::Client>,
{
    let sessions = Router::new()
        .route("/ws/logs", get(logs_socket::<E, K>))
        .with_state(supervisor);

    let api = Router::new()
        .route("/api/namespaces", get(namespaces))
        .route("/api/pods", get(pods))
        .route("/api/containers", get(containers))
        .route("/api/contexts", get(contexts))
        .route("/api/nodes", get(nodes))
        .with_state(inventory);

    let mut app = sessions.merge(api);

    // Unknown paths fall through to index.html so client-side routing works
    if let Some(dir) = assets {
        let serve_dir = ServeDir::new(dir).fallback(ServeFile::new(dir.join("index.html")));
        app = app.fallback_service(serve_dir);
    }

    app.layer(TraceLayer::new_for_http())
}

/// Open a log session. Filters are validated before the upgrade so a bad
/// pattern comes back as a plain 400 rather than a half-open socket.
async fn logs_socket<E, K>(
    State(supervisor): State<Arc<SessionSupervisor<E, K>>>,
    Query(params): Query<SessionParams>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response
where
    E: TailEngine,
    K: Connector<Client = E::Client>,
{
    let session = match supervisor.prepare(params) {
        Ok(session) => session,
        Err(e) => {
            tracing::info!(error = %e, "rejected log session");
            return (StatusCode::BAD_REQUEST, Json(ErrorFrame::new(e.to_string()))).into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    upgrade.on_upgrade(move |socket| async move {
        let (sink, stream) = transport::split(socket);
        session.run(sink, stream).await;
    })
}

async fn namespaces(
    State(inventory): State<Arc<Inventory>>,
    Query(query): Query<InventoryQuery>,
) -> Response {
    list(&inventory, InventoryKind::Namespaces, &query).await
}

async fn pods(
    State(inventory): State<Arc<Inventory>>,
    Query(query): Query<InventoryQuery>,
) -> Response {
    list(&inventory, InventoryKind::Pods, &query).await
}

async fn containers(
    State(inventory): State<Arc<Inventory>>,
    Query(query): Query<InventoryQuery>,
) -> Response {
    list(&inventory, InventoryKind::Containers, &query).await
}

async fn contexts(
    State(inventory): State<Arc<Inventory>>,
    Query(query): Query<InventoryQuery>,
) -> Response {
    list(&inventory, InventoryKind::Contexts, &query).await
}

async fn nodes(
    State(inventory): State<Arc<Inventory>>,
    Query(query): Query<InventoryQuery>,
) -> Response {
    list(&inventory, InventoryKind::Nodes, &query).await
}

async fn list(inventory: &Inventory, kind: InventoryKind, query: &InventoryQuery) -> Response {
    match inventory.list(kind, query).await {
        Ok(names) => Json(names).into_response(),
        Err(e) => {
            tracing::warn!(?kind, error = %e, "inventory lookup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorFrame::new(e.to_string()))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use kubestream_k8s::KubeConnector;
    use kubestream_logs::KubeTailer;
    use tower::ServiceExt;

    use crate::config::SessionTimings;

    fn app(kubectl: &str) -> Router {
        let supervisor = SessionSupervisor::new(
            KubeTailer::new(),
            KubeConnector::new(),
            SessionTimings::default(),
        );
        router(Arc::new(supervisor), Arc::new(Inventory::new(kubectl)), None)
    }

    fn upgrade_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    async fn error_body(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let frame: ErrorFrame = serde_json::from_slice(&bytes).unwrap();
        frame.error
    }

    #[tokio::test]
    async fn test_invalid_query_rejected_before_upgrade() {
        let response = app("kubectl")
            .oneshot(upgrade_request("/ws/logs?query=%5Binvalid&namespace=default"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(error_body(response).await.contains("query"));
    }

    #[tokio::test]
    async fn test_missing_query_rejected() {
        let response = app("kubectl")
            .oneshot(upgrade_request("/ws/logs?namespace=default"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(error_body(response).await.contains("query"));
    }

    #[tokio::test]
    async fn test_valid_query_reaches_upgrade() {
        // Without a real connection the upgrade itself is refused, but not by us
        let response = app("kubectl")
            .oneshot(upgrade_request("/ws/logs?query=web&tail=100"))
            .await
            .unwrap();

        assert_ne!(response.status(), StatusCode::NOT_FOUND);
        let content_type = response.headers().get(header::CONTENT_TYPE);
        assert_ne!(
            content_type.and_then(|v| v.to_str().ok()),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn test_inventory_failure_is_json_error() {
        let response = app("/nonexistent/kubectl")
            .oneshot(
                Request::builder()
                    .uri("/api/pods?namespace=default")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(error_body(response).await.contains("/nonexistent/kubectl"));
    }

    #[tokio::test]
    async fn test_unknown_path_without_assets_is_not_found() {
        let response = app("kubectl")
            .oneshot(Request::builder().uri("/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
