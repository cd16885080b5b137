//! Inkboard Relay Server
//!
//! Reference counterpart for the Inkboard collaboration client: issues channel
//! tokens, relays room events over WebSocket and stores uploaded image blobs.
//!
//! ## Protocol
//!
//! Clients send JSON envelopes:
//! ```json
//! { "type": "broadcast", "event": { "type": "stroke-add", ... } }
//! { "type": "update-presence", "presence": { "userId": "u1", ... } }
//! ```
//! Broadcast envelopes reach every other connection in the room unchanged.
//! Presence updates are forwarded as `{"type":"presence", ...}` and a
//! `{"type":"presence-leave","userId":..}` is sent when a user disconnects.

mod state;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use state::{AppState, Claims, RelayConfig, TokenRequest};

/// A message from a client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum InboundMessage {
    Broadcast { event: Value },
    UpdatePresence { presence: Value },
}

/// A message to a client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum OutboundMessage {
    Broadcast {
        event: Value,
    },
    Presence {
        presence: Value,
    },
    PresenceLeave {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Error {
        message: String,
    },
}

impl OutboundMessage {
    fn encode(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!("Failed to encode outbound message: {}", e);
                None
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: String,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    url: String,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inkboard_relay=info,tower_http=info".into()),
        )
        .init();

    let config = RelayConfig::from_env();
    let addr = config.addr;
    let state = Arc::new(AppState::new(config));

    let app = router(state);

    info!("Inkboard relay listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws?token=...", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/token", post(issue_token))
        .route("/ws", get(ws_handler))
        .route("/blobs/{*path}", get(get_blob).put(put_blob))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> &'static str {
    "Inkboard Relay Server - request a token at /token, then connect to /ws?token=..."
}

async fn health() -> &'static str {
    "ok"
}

async fn issue_token(State(state): State<Arc<AppState>>, Json(request): Json<TokenRequest>) -> Response {
    if request.room.is_empty() || request.user_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "room and userId are required").into_response();
    }
    info!("Issuing token for {} in room {}", request.user_id, request.room);
    if request.user_token.is_some() {
        debug!("{} presented a user token", request.user_id);
    }
    let token = state.issue_token(request, Instant::now());
    Json(TokenResponse { token }).into_response()
}

async fn put_blob(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty body").into_response();
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream");
    debug!("Stored blob {} ({} bytes)", path, body.len());
    let url = state.put_blob(&path, content_type, body);
    Json(UploadResponse { url }).into_response()
}

async fn get_blob(State(state): State<Arc<AppState>>, Path(path): Path<String>) -> Response {
    match state.get_blob(&path) {
        Some((content_type, bytes)) => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// WebSocket upgrade. Unknown or expired tokens get 401.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(claims) = state.verify_token(&params.token, Instant::now()) else {
        warn!("Rejected connection with invalid token");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, claims))
}

/// Handle a WebSocket connection for the room its token was issued for.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, claims: Claims) {
    let conn_id = Uuid::new_v4().to_string();
    let room = claims.room.clone();
    let (mut sender, mut receiver) = socket.split();
    let (mut room_rx, snapshots) = state.join_room(&room, &conn_id);
    info!(
        "{} ({}) joined room {} as {}, {} connected",
        claims.user_name,
        claims.user_id,
        room,
        claims.user_role,
        state.peer_count(&room)
    );
    debug!("{} uses color {}", claims.user_id, claims.user_color);

    for snapshot in snapshots {
        if sender.send(Message::Text(snapshot.into())).await.is_err() {
            state.leave_room(&room, &conn_id, &claims.user_id);
            return;
        }
    }

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<InboundMessage>(&text) {
                            Ok(InboundMessage::Broadcast { event }) => {
                                // Forwarded as received.
                                if let Some(json) = (OutboundMessage::Broadcast { event }).encode() {
                                    state.broadcast(&room, &conn_id, json);
                                }
                            }
                            Ok(InboundMessage::UpdatePresence { presence }) => {
                                if let Some(json) = (OutboundMessage::Presence { presence }).encode() {
                                    state.record_presence(&room, &claims.user_id, &json);
                                    state.broadcast(&room, &conn_id, json);
                                }
                            }
                            Err(e) => {
                                warn!("Invalid message from {}: {}", claims.user_id, e);
                                let error = OutboundMessage::Error {
                                    message: format!("Invalid message: {}", e),
                                };
                                if let Some(json) = error.encode() {
                                    let _ = sender.send(Message::Text(json.into())).await;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Binary, ping and pong are ignored
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", claims.user_id, e);
                        break;
                    }
                }
            }

            msg = room_rx.recv() => {
                match msg {
                    Ok((from, json)) => {
                        // Don't echo back to sender
                        if from != conn_id && sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("{} lagged, {} messages dropped", claims.user_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    cleanup(&state, &room, &conn_id, &claims);
}

fn cleanup(state: &AppState, room: &str, conn_id: &str, claims: &Claims) {
    state.leave_room(room, conn_id, &claims.user_id);
    let leave = OutboundMessage::PresenceLeave {
        user_id: claims.user_id.clone(),
    };
    if let Some(json) = leave.encode() {
        state.broadcast(room, conn_id, json);
    }
    info!("{} left room {}", claims.user_id, room);
}

#[cfg(test)]
mod tests {
    use super::*;
    use state::RoomMessage;

    #[test]
    fn test_broadcast_event_is_relayed_unchanged() {
        let text = r#"{"type":"broadcast","event":{"type":"canvas-clear","eventId":"e1","userId":"u1","timestamp":5}}"#;
        let Ok(InboundMessage::Broadcast { event }) = serde_json::from_str::<InboundMessage>(text) else {
            panic!("expected broadcast");
        };
        let out = OutboundMessage::Broadcast { event }.encode().unwrap();
        let original: Value = serde_json::from_str(text).unwrap();
        let relayed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(original, relayed);
    }

    #[test]
    fn test_presence_update_becomes_presence() {
        let text = r#"{"type":"update-presence","presence":{"userId":"u1","userName":"Ann"}}"#;
        let Ok(InboundMessage::UpdatePresence { presence }) = serde_json::from_str::<InboundMessage>(text) else {
            panic!("expected presence");
        };
        let out: Value = serde_json::from_str(&OutboundMessage::Presence { presence }.encode().unwrap()).unwrap();
        assert_eq!(out["type"], "presence");
        assert_eq!(out["presence"]["userName"], "Ann");
    }

    #[test]
    fn test_presence_leave_shape() {
        let out = OutboundMessage::PresenceLeave {
            user_id: "u1".to_string(),
        }
        .encode()
        .unwrap();
        assert_eq!(out, r#"{"type":"presence-leave","userId":"u1"}"#);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<InboundMessage>(r#"{"type":"join","room":"r"}"#).is_err());
    }

    #[tokio::test]
    async fn test_leaving_announces_departure() {
        let state = AppState::new(RelayConfig::default());
        let claims = Claims {
            room: "r1".to_string(),
            user_id: "u1".to_string(),
            user_name: "Ann".to_string(),
            user_color: "#000000ff".to_string(),
            user_role: "editor".to_string(),
        };
        let (mut watcher, _) = state.join_room("r1", "conn-w");
        let _ = state.join_room("r1", "conn-1");

        cleanup(&state, "r1", "conn-1", &claims);

        let (from, json): RoomMessage = watcher.recv().await.unwrap();
        assert_eq!(from, "conn-1");
        assert_eq!(json, r#"{"type":"presence-leave","userId":"u1"}"#);
        assert_eq!(state.peer_count("r1"), 1);
    }
}
