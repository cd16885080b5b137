//! Shared relay state: issued tokens, rooms and stored blobs.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Capacity of each room's fan-out channel.
const CHANNEL_CAPACITY: usize = 256;

const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

/// Relay settings, read from the environment.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub addr: SocketAddr,
    pub token_ttl: Duration,
    /// Prefix for blob URLs handed back to clients.
    pub public_url: String,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let addr = env::var("INKBOARD_RELAY_ADDR")
            .ok()
            .and_then(|value| match value.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!("Ignoring INKBOARD_RELAY_ADDR={}: {}", value, e);
                    None
                }
            })
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3030)));
        let token_ttl = env::var("INKBOARD_TOKEN_TTL_SECS")
            .ok()
            .and_then(|value| value.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_TOKEN_TTL_SECS));
        let public_url = env::var("INKBOARD_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", addr.port()));
        Self {
            addr,
            token_ttl,
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3030)),
            token_ttl: Duration::from_secs(DEFAULT_TOKEN_TTL_SECS),
            public_url: "http://localhost:3030".to_string(),
        }
    }
}

/// Body of `POST /token`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub room: String,
    pub user_id: String,
    pub user_name: String,
    pub user_color: String,
    pub user_role: String,
    /// Accepted for compatibility; the relay does not verify it.
    #[serde(default)]
    pub user_token: Option<String>,
}

/// Who a token was issued to.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    pub room: String,
    pub user_id: String,
    pub user_name: String,
    pub user_color: String,
    pub user_role: String,
}

struct IssuedToken {
    claims: Claims,
    expires_at: Instant,
}

/// What a room fans out: the sending connection and the encoded message.
pub type RoomMessage = (String, String);

/// One collaboration room.
struct Room {
    tx: broadcast::Sender<RoomMessage>,
    /// Connection ids in the room.
    peers: Vec<String>,
    /// Last presence message per user, replayed to new joiners.
    presence: HashMap<String, String>,
}

impl Room {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            peers: Vec::new(),
            presence: HashMap::new(),
        }
    }
}

struct Blob {
    content_type: String,
    bytes: Bytes,
}

/// Shared application state.
pub struct AppState {
    config: RelayConfig,
    tokens: DashMap<String, IssuedToken>,
    rooms: DashMap<String, Room>,
    blobs: DashMap<String, Blob>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            tokens: DashMap::new(),
            rooms: DashMap::new(),
            blobs: DashMap::new(),
        }
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    /// Issue a token for `request`, valid for the configured TTL from `now`.
    pub fn issue_token(&self, request: TokenRequest, now: Instant) -> String {
        self.tokens.retain(|_, issued| issued.expires_at > now);

        let token = Uuid::new_v4().simple().to_string();
        self.tokens.insert(
            token.clone(),
            IssuedToken {
                claims: Claims {
                    room: request.room,
                    user_id: request.user_id,
                    user_name: request.user_name,
                    user_color: request.user_color,
                    user_role: request.user_role,
                },
                expires_at: now + self.config.token_ttl,
            },
        );
        token
    }

    /// Claims of a known, unexpired token.
    pub fn verify_token(&self, token: &str, now: Instant) -> Option<Claims> {
        let issued = self.tokens.get(token)?;
        if issued.expires_at <= now {
            debug!("Rejected expired token for {}", issued.claims.user_id);
            return None;
        }
        Some(issued.claims.clone())
    }

    // =========================================================================
    // Rooms
    // =========================================================================

    /// Add a connection to a room. Returns its receiver and the presence
    /// snapshots of users already there.
    pub fn join_room(&self, room_id: &str, peer_id: &str) -> (broadcast::Receiver<RoomMessage>, Vec<String>) {
        let mut room = self.rooms.entry(room_id.to_string()).or_insert_with(Room::new);
        room.peers.push(peer_id.to_string());
        let rx = room.tx.subscribe();
        let snapshots = room.presence.values().cloned().collect();
        (rx, snapshots)
    }

    /// Remove a connection. Empty rooms are dropped.
    pub fn leave_room(&self, room_id: &str, peer_id: &str, user_id: &str) {
        let mut empty = false;
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.peers.retain(|peer| peer != peer_id);
            room.presence.remove(user_id);
            empty = room.peers.is_empty();
        }
        if empty {
            self.rooms.remove(room_id);
        }
    }

    /// Remember a user's latest presence message.
    pub fn record_presence(&self, room_id: &str, user_id: &str, message: &str) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.presence.insert(user_id.to_string(), message.to_string());
        }
    }

    /// Fan a message out to everyone in the room. Receivers skip their own.
    pub fn broadcast(&self, room_id: &str, from: &str, message: String) {
        if let Some(room) = self.rooms.get(room_id) {
            // No receivers is not an error.
            let _ = room.tx.send((from.to_string(), message));
        }
    }

    pub fn peer_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|room| room.peers.len()).unwrap_or(0)
    }

    // =========================================================================
    // Blobs
    // =========================================================================

    /// Store bytes under `path` and return the URL they are served from.
    pub fn put_blob(&self, path: &str, content_type: &str, bytes: Bytes) -> String {
        self.blobs.insert(
            path.to_string(),
            Blob {
                content_type: content_type.to_string(),
                bytes,
            },
        );
        format!("{}/blobs/{}", self.config.public_url, path)
    }

    pub fn get_blob(&self, path: &str) -> Option<(String, Bytes)> {
        self.blobs
            .get(path)
            .map(|blob| (blob.content_type.clone(), blob.bytes.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(room: &str, user: &str) -> TokenRequest {
        TokenRequest {
            room: room.to_string(),
            user_id: user.to_string(),
            user_name: user.to_uppercase(),
            user_color: "#ff0000ff".to_string(),
            user_role: "editor".to_string(),
            user_token: None,
        }
    }

    fn state() -> AppState {
        AppState::new(RelayConfig {
            token_ttl: Duration::from_secs(60),
            ..RelayConfig::default()
        })
    }

    #[test]
    fn test_token_carries_claims_until_expiry() {
        let state = state();
        let now = Instant::now();
        let token = state.issue_token(request("r1", "alice"), now);

        let claims = state.verify_token(&token, now + Duration::from_secs(59)).unwrap();
        assert_eq!(claims.room, "r1");
        assert_eq!(claims.user_id, "alice");
        assert!(state.verify_token(&token, now + Duration::from_secs(60)).is_none());
        assert!(state.verify_token("bogus", now).is_none());
    }

    #[test]
    fn test_expired_tokens_are_purged_on_issue() {
        let state = state();
        let now = Instant::now();
        state.issue_token(request("r1", "alice"), now);
        state.issue_token(request("r1", "bob"), now + Duration::from_secs(120));
        assert_eq!(state.tokens.len(), 1);
    }

    #[test]
    fn test_room_fan_out_and_presence_snapshot() {
        let state = state();
        let (mut rx_a, snapshot) = state.join_room("r1", "conn-a");
        assert!(snapshot.is_empty());
        state.record_presence("r1", "alice", r#"{"type":"presence"}"#);

        let (_rx_b, snapshot) = state.join_room("r1", "conn-b");
        assert_eq!(snapshot, vec![r#"{"type":"presence"}"#.to_string()]);
        assert_eq!(state.peer_count("r1"), 2);

        state.broadcast("r1", "conn-b", "hello".to_string());
        assert_eq!(rx_a.try_recv().unwrap(), ("conn-b".to_string(), "hello".to_string()));
    }

    #[test]
    fn test_last_leave_drops_room() {
        let state = state();
        let _a = state.join_room("r1", "conn-a");
        let _b = state.join_room("r1", "conn-b");
        state.record_presence("r1", "alice", "p");

        state.leave_room("r1", "conn-a", "alice");
        assert_eq!(state.peer_count("r1"), 1);
        let (_c, snapshot) = state.join_room("r1", "conn-c");
        assert!(snapshot.is_empty());

        state.leave_room("r1", "conn-b", "bob");
        state.leave_room("r1", "conn-c", "carol");
        assert!(state.rooms.get("r1").is_none());
    }

    #[test]
    fn test_blob_round_trip() {
        let state = state();
        let url = state.put_blob("rooms/r1/users/u/images/a.png", "image/png", Bytes::from_static(b"png"));
        assert_eq!(url, "http://localhost:3030/blobs/rooms/r1/users/u/images/a.png");

        let (content_type, bytes) = state.get_blob("rooms/r1/users/u/images/a.png").unwrap();
        assert_eq!(content_type, "image/png");
        assert_eq!(&bytes[..], b"png");
        assert!(state.get_blob("missing").is_none());
    }
}
