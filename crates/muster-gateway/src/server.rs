use crate::router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use muster_runtime::Engine;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds the axum application for an engine.
pub struct GatewayServer;

impl GatewayServer {
    /// Assembles the full route table. The engine is the only state; every
    /// handler borrows it through the extension.
    pub fn build(engine: Arc<Engine>) -> Router {
        Router::new()
            .route("/tasks", post(router::submit_task))
            .route(
                "/tasks/{id}",
                get(router::task_status).delete(router::cancel_task),
            )
            .route("/tasks/{id}/start", post(router::start_task))
            .route("/tasks/{id}/complete", post(router::complete_task))
            .route("/tasks/{id}/fail", post(router::fail_task))
            .route("/agents", post(router::register_agent))
            .route("/agents/{id}", axum::routing::delete(router::deregister_agent))
            .route("/agents/{id}/heartbeat", post(router::heartbeat))
            .route("/proposals", post(router::submit_proposal))
            .route("/resources/{id}/request", post(router::request_resource))
            .route("/resources/{id}/release", post(router::release_resource))
            .route("/metrics", get(router::metrics))
            .route("/alerts/ws", get(alerts_ws_handler))
            .route("/health", get(health_handler))
            .with_state(engine)
    }
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({"status": "ok", "service": "muster"}))
}

async fn alerts_ws_handler(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<Engine>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_alerts(socket, engine))
}

/// Forwards alert events to a WebSocket client as JSON, one alert per text
/// frame. A client that falls behind the broadcast buffer misses alerts
/// rather than stalling the monitor.
async fn stream_alerts(socket: WebSocket, engine: Arc<Engine>) {
    let mut alerts = engine.subscribe_alerts();
    let (mut sender, mut receiver) = {
        use futures_util::StreamExt;
        socket.split()
    };
    info!("Alert subscriber connected");

    let send_task = tokio::spawn(async move {
        use futures_util::SinkExt;
        loop {
            match alerts.recv().await {
                Ok(alert) => {
                    let json = match serde_json::to_string(&alert) {
                        Ok(json) => json,
                        Err(_) => continue,
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "Alert subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Drain client frames so close handshakes complete.
    let recv_task = tokio::spawn(async move {
        use futures_util::StreamExt;
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }
    info!("Alert subscriber disconnected");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use muster_runtime::RuntimeConfig;
    use tower::ServiceExt;

    async fn app() -> Router {
        let engine = Arc::new(Engine::new(RuntimeConfig::default()).await.unwrap());
        GatewayServer::build(engine)
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_submit_and_fetch_task() {
        let app = app().await;
        let body = serde_json::json!({
            "id": "t-1",
            "required": [{"name": "weld", "version": 1}],
            "priority": 5,
        });
        let response = app
            .clone()
            .oneshot(
                Request::post("/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(Request::get("/tasks/t-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_duplicate_task_conflicts() {
        let app = app().await;
        let body = serde_json::json!({"id": "t-1"});
        for expected in [StatusCode::CREATED, StatusCode::CONFLICT] {
            let response = app
                .clone()
                .oneshot(
                    Request::post("/tasks")
                        .header("content-type", "application/json")
                        .body(Body::from(body.to_string()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), expected);
        }
    }

    #[tokio::test]
    async fn test_unknown_task_is_404() {
        let response = app()
            .await
            .oneshot(Request::get("/tasks/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_agent_is_404() {
        let response = app()
            .await
            .oneshot(
                Request::post("/agents/ghost/heartbeat")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
