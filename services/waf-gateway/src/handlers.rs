use crate::app::AppState;
use crate::telemetry::SubscriberKind;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "message": "WAF Proxy Service",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "service": "waf-gateway" }))
}

pub async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let totals = state.hub.global_stats().await;
    Json(json!({
        "total_requests": totals.total_requests,
        "total_blocked": totals.total_blocked,
        "total_allowed": totals.total_allowed,
        "requests_per_second": totals.requests_per_second,
        "active_connections": state.hub.connection_count().await,
    }))
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(?err, "Failed to render metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("metrics unavailable"))
                .expect("failed to build metrics error response")
        }
    }
}

#[derive(Deserialize)]
pub struct VerifyRecaptchaRequest {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    ip: Option<String>,
}

/// Verification endpoint the denial page drives. Sets the solved marker on
/// success so the next request from that address passes the recaptcha rule.
pub async fn verify_recaptcha(
    State(state): State<AppState>,
    Json(request): Json<VerifyRecaptchaRequest>,
) -> Response {
    let token = request.token.filter(|t| !t.is_empty());
    let ip = request.ip.filter(|i| !i.is_empty());
    let (Some(token), Some(ip)) = (token, ip) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing data" })),
        )
            .into_response();
    };

    if state.captcha.verify_and_mark(&token, &ip).await {
        (StatusCode::OK, Json(json!({ "status": "success" }))).into_response()
    } else {
        (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Verification failed" })),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
}

pub async fn ws_endpoint(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let kind = match (query.kind.as_deref(), query.client_id) {
        (Some("client"), Some(client_id)) if !client_id.is_empty() => {
            SubscriberKind::Tenant(client_id)
        }
        _ => SubscriberKind::Admin,
    };
    ws.on_upgrade(move |socket| dashboard_session(socket, state, kind))
}

/// One dashboard connection: a writer task pumps the hub channel into the
/// socket while this task answers ping/status frames. Either side closing
/// tears the session down and unregisters it.
async fn dashboard_session(socket: WebSocket, state: AppState, kind: SubscriberKind) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(64);

    let id = state.hub.register(kind.clone(), tx.clone()).await;
    state.metrics.dashboard_connected();

    let snapshot = state.hub.snapshot(&kind).await;
    if let Ok(payload) = serde_json::to_string(&snapshot) {
        let _ = tx.send(Message::Text(payload)).await;
    }

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(text) => match text.as_str() {
                "ping" => {
                    let _ = tx.send(Message::Text("pong".to_string())).await;
                }
                "status" => {
                    let status = json!({
                        "type": "status",
                        "connections": state.hub.connection_count().await,
                        "timestamp": Utc::now().to_rfc3339(),
                    });
                    let _ = tx.send(Message::Text(status.to_string())).await;
                }
                other => {
                    debug!(message = other, "Ignoring unknown dashboard message");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.hub.unregister(&id).await;
    state.metrics.dashboard_disconnected();
    writer.abort();
}
