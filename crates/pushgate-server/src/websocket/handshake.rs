//! The upgrade boundary: axum `/ws` wiring plus the `/metrics` render route.
//!
//! The wire protocol itself is delegated to axum's standard WebSocket
//! upgrade; this module only configures it from gateway settings, maps
//! upgrade failures into [`GatewayError::Handshake`], and wires a freshly
//! upgraded socket into its shard: create the actor, spawn its flows,
//! register it. Request validation beyond "a token is present" belongs to
//! the embedding application.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use pushgate_core::errors::GatewayError;
use tracing::{info, warn};

use crate::gateway::Gateway;
use crate::metrics::CONNECTIONS_TOTAL;
use crate::websocket::connection::{HandshakeRequest, Receiver, spawn_flows};

/// Shared state behind the gateway routes.
#[derive(Clone)]
pub struct GatewayState {
    /// The assembled gateway.
    pub gateway: Arc<Gateway>,
    /// Receive handler invoked for every inbound frame.
    pub handler: Arc<dyn Receiver>,
    /// Handle for rendering `/metrics`.
    pub metrics: PrometheusHandle,
}

/// Minimal router: `GET /ws?token=...` upgrades, `GET /metrics` renders.
pub fn router(
    gateway: Arc<Gateway>,
    handler: Arc<dyn Receiver>,
    metrics: PrometheusHandle,
) -> Router {
    let state = GatewayState {
        gateway,
        handler,
        metrics,
    };
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn ws_handler(
    State(state): State<GatewayState>,
    Query(params): Query<HashMap<String, String>>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = params.get("token").filter(|t| !t.is_empty()).cloned() else {
        return (StatusCode::BAD_REQUEST, "missing session token").into_response();
    };
    let request = HandshakeRequest { uri, headers };
    accept(state.gateway, ws, token, state.handler, request)
}

async fn metrics_handler(State(state): State<GatewayState>) -> String {
    crate::metrics::render(&state.metrics)
}

/// Configure and complete the upgrade, then wire the socket into its shard.
///
/// Registration happens after the flows are spawned so an evicted
/// predecessor is torn down only once the replacement is fully live.
pub fn accept(
    gateway: Arc<Gateway>,
    ws: WebSocketUpgrade,
    token: String,
    handler: Arc<dyn Receiver>,
    request: HandshakeRequest,
) -> Response {
    let settings = gateway.settings();
    let ws = ws
        .max_message_size(settings.read_buffer_size)
        .write_buffer_size(settings.write_buffer_size)
        .on_failed_upgrade({
            let token = token.clone();
            move |e: axum::Error| {
                let err = GatewayError::Handshake(e.to_string());
                warn!(token = %token, error = %err, "websocket upgrade failed");
            }
        });
    ws.on_upgrade(move |socket| async move {
        counter!(CONNECTIONS_TOTAL).increment(1);
        let bucket = gateway.bucket_for(&token);
        let (conn, outbound_rx) = bucket.create_connection(token.clone(), request);
        spawn_flows(Arc::clone(&conn), socket, outbound_rx, handler);
        bucket.register(conn);
        info!(token = %token, "connection established");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::MemoryAcker;
    use crate::settings::GatewaySettings;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use bytes::Bytes;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    struct Discard;

    #[async_trait]
    impl Receiver for Discard {
        async fn handle(&self, _conn: &Arc<crate::ClientConnection>, _frame: Bytes) {}
    }

    fn make_router() -> Router {
        let gateway =
            Gateway::new(GatewaySettings::default(), Arc::new(MemoryAcker::new())).unwrap();
        let handle = PrometheusBuilder::new().build_recorder().handle();
        router(gateway, Arc::new(Discard), handle)
    }

    #[tokio::test]
    async fn metrics_route_renders() {
        let router = make_router();
        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ws_route_rejects_plain_http() {
        // No upgrade headers: the extractor refuses before any connection
        // state is touched.
        let router = make_router();
        let response = router
            .oneshot(
                Request::get("/ws?token=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
