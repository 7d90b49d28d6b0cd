// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! HTTP ingress - health check, state snapshot and diagnostics upload
//!
//! Handlers never touch engine state. Diagnostics are decoded here and
//! queued for the owning loop; `GET /commands` reads the published snapshot.

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::HttpConfig;
use crate::core::{AlertReason, DeviceState, EventBus, LoopEvent, StateSnapshot};
use crate::router::{InboundEvent, MessageRouter};

#[derive(Clone)]
struct HttpState {
    router: MessageRouter,
    events: mpsc::Sender<LoopEvent>,
    snapshot: watch::Receiver<StateSnapshot>,
}

/// `GET /commands` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandsResponse {
    pub state: DeviceState,
    pub reason: AlertReason,
}

/// `POST /diagnostics` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusResponse {
    fn success() -> Self {
        Self {
            status: "success".to_string(),
            message: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message.into()),
        }
    }
}

/// Build the HTTP application
pub fn app(router: MessageRouter, bus: &EventBus) -> Router {
    let state = HttpState {
        router,
        events: bus.events(),
        snapshot: bus.subscribe_snapshot(),
    };

    Router::new()
        .route("/", get(health))
        .route("/commands", get(commands))
        .route("/diagnostics", post(diagnostics))
        .with_state(state)
}

/// Bind and serve until shutdown is broadcast
pub async fn serve(
    config: &HttpConfig,
    router: MessageRouter,
    bus: &EventBus,
) -> Result<JoinHandle<()>> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Starting HTTP server on {}", addr);

    let app = app(router, bus);
    let mut shutdown: broadcast::Receiver<()> = bus.subscribe_shutdown();

    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await;

        match result {
            Ok(()) => info!("HTTP server stopped"),
            Err(e) => error!("HTTP server error: {}", e),
        }
    }))
}

async fn health() -> &'static str {
    "Server is running"
}

async fn commands(State(state): State<HttpState>) -> Json<CommandsResponse> {
    let snapshot = state.snapshot.borrow().clone();
    Json(CommandsResponse {
        state: snapshot.state,
        reason: snapshot.reason,
    })
}

async fn diagnostics(
    State(state): State<HttpState>,
    body: Bytes,
) -> (StatusCode, Json<StatusResponse>) {
    let event = match state.router.decode_diagnostic("http:/diagnostics", &body) {
        Ok(event) => event,
        Err(e) => {
            warn!("Rejected diagnostics upload: {}", e);
            return (StatusCode::BAD_REQUEST, Json(StatusResponse::error(e.to_string())));
        }
    };

    let queued = LoopEvent::Ingress(InboundEvent::Diagnostic(event));
    if state.events.send(queued).await.is_err() {
        error!("Engine loop is gone, dropping diagnostics upload");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(StatusResponse::error("engine unavailable")),
        );
    }

    (StatusCode::OK, Json(StatusResponse::success()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn setup() -> (Router, EventBus, mpsc::Receiver<LoopEvent>) {
        let (bus, rx) = EventBus::new(16);
        let app = app(MessageRouter::new(TopicConfig::default()), &bus);
        (app, bus, rx)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _bus, _rx) = setup();
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"Server is running");
    }

    #[tokio::test]
    async fn test_commands_reads_snapshot() {
        let (app, bus, _rx) = setup();
        bus.publish_snapshot(StateSnapshot {
            state: DeviceState::Alert,
            reason: AlertReason::Geofence,
            ..Default::default()
        });

        let response = app
            .oneshot(Request::builder().uri("/commands").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: CommandsResponse = body_json(response).await;
        assert_eq!(
            body,
            CommandsResponse {
                state: DeviceState::Alert,
                reason: AlertReason::Geofence,
            }
        );
    }

    #[tokio::test]
    async fn test_diagnostics_are_queued() {
        let (app, _bus, mut rx) = setup();
        let request = Request::builder()
            .method("POST")
            .uri("/diagnostics")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"client_id":"esp32-01","gps":{"lat":14.6,"lon":121.0}}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: StatusResponse = body_json(response).await;
        assert_eq!(body.status, "success");

        match rx.recv().await {
            Some(LoopEvent::Ingress(InboundEvent::Diagnostic(d))) => {
                assert_eq!(d.source_id, "esp32-01");
                assert!(d.point.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_diagnostics_rejected() {
        let (app, _bus, mut rx) = setup();
        let request = Request::builder()
            .method("POST")
            .uri("/diagnostics")
            .body(Body::from("{broken"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: StatusResponse = body_json(response).await;
        assert_eq!(body.status, "error");
        assert!(rx.try_recv().is_err());
    }
}
