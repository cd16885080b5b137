//! Collaboration synchronizer.
//!
//! Keeps the local [`CanvasState`] eventually consistent with every other
//! participant in a room. There is no merge authority: strokes are additive,
//! image transforms are full replacements where the last one received wins.
//!
//! The synchronizer never awaits. It is driven from the UI loop:
//!
//! - [`Synchronizer::observe`] drains local canvas changes and turns them into broadcasts
//! - [`Synchronizer::poll`] drains the transport and applies inbound events
//! - [`Synchronizer::tick`] flushes the stroke batch and the presence throttle
//!
//! The session owns the async side (token, connect, blob transfers) and hands
//! transports in via [`Synchronizer::attach`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use kurbo::Point;

use crate::canvas::{CanvasState, ChangeKind, ChangeOrigin, SubscriberId};
use crate::collab::backoff::Backoff;
use crate::collab::protocol::{BroadcastEvent, ClientMessage, EventPayload, ImageDescriptor, Presence, ServerMessage};
use crate::collab::queue::{OfflineQueue, RecentIds};
use crate::collab::rate_limit::RateLimiter;
use crate::collab::transport::{ChannelTransport, TransportEvent};
use crate::config::SyncConfig;
use crate::error::{CanvasError, CollaborativeError};
use crate::image::{Bitmap, CanvasImage, ImageId};
use crate::strokes::{SerializableColor, Stroke};

/// Who this client is in the room.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
    pub color: SerializableColor,
    pub role: String,
}

impl Identity {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        color: SerializableColor,
        role: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            color,
            role: role.into(),
        }
    }
}

/// Channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged(ConnectionState),
    PeerPresence(Presence),
    PeerLeft { user_id: String },
    /// Reconnection gave up after `attempts` tries.
    ConnectionFailed { attempts: u32 },
    AuthFailed(String),
    /// A peer cleared the canvas.
    RemoteCleared { user_id: String },
}

pub struct Synchronizer {
    config: SyncConfig,
    identity: Identity,
    subscriber: SubscriberId,
    state: ConnectionState,
    transport: Option<Box<dyn ChannelTransport>>,

    // Outbound
    stroke_batch: Vec<Stroke>,
    batch_started: Option<Instant>,
    presence: Presence,
    presence_dirty: bool,
    presence_sent_at: Option<Instant>,
    limiter: RateLimiter,
    queue: OfflineQueue,

    // Reconnection
    backoff: Backoff,
    reconnect_at: Option<Instant>,

    // Inbound
    recent: RecentIds,
    roster: BTreeMap<String, Presence>,

    // Image transfers, completed by the session
    pending_uploads: Vec<ImageId>,
    /// Local images peers have not been told about: queued, uploading or failed.
    unannounced: BTreeSet<ImageId>,
    pending_fetches: Vec<ImageDescriptor>,

    events: Vec<SyncEvent>,
}

impl Synchronizer {
    /// Create a synchronizer and subscribe it to `state`.
    pub fn new(config: SyncConfig, identity: Identity, state: &mut CanvasState) -> Self {
        let presence = Presence::new(
            identity.user_id.clone(),
            identity.user_name.clone(),
            identity.color,
            identity.role.clone(),
        );
        Self {
            subscriber: state.subscribe(),
            state: ConnectionState::Disconnected,
            transport: None,
            stroke_batch: Vec::new(),
            batch_started: None,
            presence,
            presence_dirty: false,
            presence_sent_at: None,
            limiter: RateLimiter::new(config.rate_limit_per_window, config.rate_limit_window),
            queue: OfflineQueue::new(config.offline_queue_capacity),
            backoff: Backoff::new(config.reconnect_base_delay, config.reconnect_max_attempts),
            reconnect_at: None,
            recent: RecentIds::new(config.recent_id_capacity),
            roster: BTreeMap::new(),
            pending_uploads: Vec::new(),
            unannounced: BTreeSet::new(),
            pending_fetches: Vec::new(),
            events: Vec::new(),
            config,
            identity,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Remote participants currently present, by user id.
    pub fn roster(&self) -> &BTreeMap<String, Presence> {
        &self.roster
    }

    /// Frames waiting for a connection.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn next_reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn take_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    /// Local images whose bitmaps still need uploading before they can be announced.
    /// They stay unannounced, and their moves and deletion stay local, until
    /// [`announce_image`](Self::announce_image) succeeds. A failed upload leaves the image local-only.
    pub fn take_pending_uploads(&mut self) -> Vec<ImageId> {
        std::mem::take(&mut self.pending_uploads)
    }

    /// Remote images whose bitmaps still need downloading.
    pub fn take_pending_fetches(&mut self) -> Vec<ImageDescriptor> {
        std::mem::take(&mut self.pending_fetches)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::info!("Connection state: {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.push(SyncEvent::StatusChanged(state));
        }
    }

    // =========================================================================
    // CONNECTION LIFECYCLE
    // =========================================================================

    /// Mark a connection attempt as started. An explicit join from `Disconnected`
    /// or `Error` starts a fresh retry budget; scheduled reconnects keep counting.
    pub fn begin_connect(&mut self) {
        if matches!(self.state, ConnectionState::Disconnected | ConnectionState::Error) {
            self.backoff.reset();
        }
        self.reconnect_at = None;
        self.set_state(ConnectionState::Connecting);
    }

    /// Hand over a freshly opened transport. The state moves to `Connected`
    /// once the transport reports it.
    pub fn attach(&mut self, transport: Box<dyn ChannelTransport>) {
        if let Some(mut old) = self.transport.replace(transport) {
            old.close();
        }
        self.begin_connect();
    }

    /// The channel is open: announce presence and replay what queued up offline.
    pub fn on_connected(&mut self, now: Instant) {
        self.backoff.reset();
        self.reconnect_at = None;
        self.set_state(ConnectionState::Connected);

        self.send_presence(now);
        let queued = self.queue.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued frame(s)", queued.len());
        }
        for frame in queued {
            self.send_frame(frame, now);
        }
    }

    /// The channel failed or closed unexpectedly. Schedules a reconnect, or
    /// gives up once the attempts are used.
    pub fn on_connection_lost(&mut self, now: Instant) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        if matches!(self.state, ConnectionState::Disconnected | ConnectionState::Error) {
            return;
        }
        match self.backoff.next_delay() {
            Some(delay) => {
                log::info!(
                    "Reconnecting in {} ms (attempt {})",
                    delay.as_millis(),
                    self.backoff.attempts()
                );
                self.reconnect_at = Some(now + delay);
                self.set_state(ConnectionState::Reconnecting);
            }
            None => {
                log::warn!("Giving up after {} reconnection attempts", self.backoff.attempts());
                self.reconnect_at = None;
                self.set_state(ConnectionState::Error);
                self.events.push(SyncEvent::ConnectionFailed {
                    attempts: self.backoff.attempts(),
                });
            }
        }
    }

    /// The token was refused. Not retried.
    pub fn on_auth_failed(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("Authentication failed: {}", reason);
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.reconnect_at = None;
        self.set_state(ConnectionState::Error);
        self.events.push(SyncEvent::AuthFailed(reason));
    }

    /// Whether a scheduled reconnection is due.
    pub fn reconnect_due(&self, now: Instant) -> bool {
        self.state == ConnectionState::Reconnecting
            && self.reconnect_at.is_some_and(|at| now >= at)
    }

    /// Close the channel and cancel every timer. Unsent strokes are dropped.
    pub fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.reconnect_at = None;
        self.batch_started = None;
        self.stroke_batch.clear();
        self.presence_dirty = false;
        self.backoff.reset();
        self.roster.clear();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Disconnect and stop observing `state`.
    pub fn detach(mut self, state: &mut CanvasState) {
        self.disconnect();
        state.unsubscribe(self.subscriber);
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    fn send_frame(&mut self, frame: String, now: Instant) {
        if self.state != ConnectionState::Connected {
            self.queue.push(frame);
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            self.queue.push(frame);
            return;
        };
        if let Err(e) = transport.send(&frame) {
            log::warn!("Send failed, queueing: {}", e);
            self.queue.push(frame);
            self.on_connection_lost(now);
        }
    }

    /// Broadcast a state-changing event. Dropped once the rate limit is hit.
    fn broadcast(&mut self, payload: EventPayload, now: Instant) {
        if !self.limiter.check_and_record_at(now) {
            log::debug!("Rate limit reached, dropping {}", payload.name());
            return;
        }
        let event = BroadcastEvent::new(self.identity.user_id.clone(), payload)
            .with_attribution(self.identity.user_name.clone(), self.identity.color);
        match serde_json::to_string(&ClientMessage::Broadcast { event }) {
            Ok(frame) => self.send_frame(frame, now),
            Err(e) => log::error!("Failed to encode broadcast: {}", e),
        }
    }

    fn send_presence(&mut self, now: Instant) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let message = ClientMessage::UpdatePresence {
            presence: self.presence.clone(),
        };
        match serde_json::to_string(&message) {
            Ok(frame) => {
                if let Err(e) = transport.send(&frame) {
                    log::warn!("Presence send failed: {}", e);
                    self.on_connection_lost(now);
                    return;
                }
                self.presence_dirty = false;
                self.presence_sent_at = Some(now);
            }
            Err(e) => log::error!("Failed to encode presence: {}", e),
        }
    }

    /// Update the cumulative presence state. Sent on the next tick the
    /// throttle allows.
    pub fn update_presence(&mut self, cursor: Option<Point>, tool: Option<String>, is_drawing: bool) {
        let next = Presence {
            cursor,
            tool,
            is_drawing,
            ..self.presence.clone()
        };
        if next != self.presence {
            self.presence = next;
            self.presence_dirty = true;
        }
    }

    /// Turn local canvas changes into broadcasts. Remote-origin changes are skipped.
    pub fn observe(&mut self, state: &mut CanvasState, now: Instant) {
        let changes = state.drain_changes(self.subscriber);
        let mut transforms: Vec<ImageId> = Vec::new();

        for change in changes {
            if change.origin == ChangeOrigin::Remote {
                continue;
            }
            match change.kind {
                ChangeKind::StrokeAdded(id) => {
                    if let Some(stroke) = state.strokes().iter().find(|s| s.id == id) {
                        self.stroke_batch.push(stroke.clone());
                        self.batch_started.get_or_insert(now);
                    }
                }
                ChangeKind::StrokeRemoved(id) => {
                    let before = self.stroke_batch.len();
                    self.stroke_batch.retain(|s| s.id != id);
                    if self.stroke_batch.len() == before {
                        self.broadcast(EventPayload::StrokeUndo { stroke_id: id }, now);
                    }
                }
                ChangeKind::Cleared => {
                    self.stroke_batch.clear();
                    self.batch_started = None;
                    self.pending_uploads.clear();
                    self.unannounced.clear();
                    transforms.clear();
                    self.broadcast(EventPayload::CanvasClear, now);
                }
                ChangeKind::ImageAdded(id) => {
                    let Some(image) = state.image(&id) else { continue };
                    match &image.url {
                        Some(url) => {
                            let descriptor = ImageDescriptor::from_image(image, url.clone());
                            self.broadcast(EventPayload::ImageAdd { image: descriptor }, now);
                        }
                        None => {
                            self.unannounced.insert(id.clone());
                            self.pending_uploads.push(id);
                        }
                    }
                }
                ChangeKind::ImageRemoved(id) => {
                    transforms.retain(|t| *t != id);
                    self.pending_uploads.retain(|p| *p != id);
                    if !self.unannounced.remove(&id) {
                        self.broadcast(EventPayload::ImageDelete { id }, now);
                    }
                }
                ChangeKind::TransformChanged(id) => {
                    if !transforms.contains(&id) {
                        transforms.push(id);
                    }
                }
                ChangeKind::SettingsChanged => {
                    let settings = state.settings().clone();
                    self.broadcast(EventPayload::CanvasSettings { settings }, now);
                }
                ChangeKind::SelectionChanged => {}
            }
        }

        for id in transforms {
            if self.unannounced.contains(&id) {
                continue;
            }
            if let Some(image) = state.image(&id) {
                let transform_matrix = crate::viewport::to_matrix4(image.transform());
                self.broadcast(EventPayload::ImageUpdate { id, transform_matrix }, now);
            }
        }
    }

    /// An upload finished: remember the URL and announce the image.
    pub fn announce_image(
        &mut self,
        state: &mut CanvasState,
        id: &str,
        url: &str,
        now: Instant,
    ) -> Result<(), CanvasError> {
        state.set_image_url(id, url)?;
        let image = state
            .image(id)
            .ok_or_else(|| CanvasError::UnknownImage(id.to_string()))?;
        let descriptor = ImageDescriptor::from_image(image, url);
        self.unannounced.remove(id);
        self.broadcast(EventPayload::ImageAdd { image: descriptor }, now);
        Ok(())
    }

    /// Flush the stroke batch and the presence throttle when their windows elapse.
    pub fn tick(&mut self, now: Instant) {
        let window = self.config.stroke_batch_window;
        if self
            .batch_started
            .is_some_and(|started| now.saturating_duration_since(started) >= window)
        {
            self.flush_strokes(now);
        }

        if self.presence_dirty
            && self.state == ConnectionState::Connected
            && self
                .presence_sent_at
                .is_none_or(|sent| now.saturating_duration_since(sent) >= self.config.presence_throttle)
        {
            self.send_presence(now);
        }
    }

    /// Send the stroke batch now, regardless of the window.
    pub fn flush_strokes(&mut self, now: Instant) {
        self.batch_started = None;
        if self.stroke_batch.is_empty() {
            return;
        }
        let strokes = std::mem::take(&mut self.stroke_batch);
        self.broadcast(EventPayload::StrokeAdd { strokes }, now);
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Drain the transport and react to what it reports.
    pub fn poll(&mut self, state: &mut CanvasState, now: Instant) {
        let events = match self.transport.as_mut() {
            Some(transport) => transport.poll_events(),
            None => return,
        };
        for event in events {
            match event {
                TransportEvent::Connected => self.on_connected(now),
                TransportEvent::Message(text) => {
                    if let Err(e) = self.handle_message(&text, state) {
                        log::warn!("Dropping inbound message: {}", e);
                    }
                }
                TransportEvent::Closed => {
                    log::info!("Channel closed");
                    self.on_connection_lost(now);
                    break;
                }
                TransportEvent::Error(e) => {
                    log::warn!("Channel error: {}", e);
                    self.on_connection_lost(now);
                    break;
                }
            }
        }
    }

    /// Apply one inbound frame. Malformed frames are rejected without touching state.
    pub fn handle_message(
        &mut self,
        text: &str,
        state: &mut CanvasState,
    ) -> Result<(), CollaborativeError> {
        let message: ServerMessage =
            serde_json::from_str(text).map_err(|e| CollaborativeError::Malformed(e.to_string()))?;

        match message {
            ServerMessage::Broadcast { event } => self.apply_event(event, state),
            ServerMessage::Presence { presence } => {
                if presence.user_id != self.identity.user_id {
                    self.roster.insert(presence.user_id.clone(), presence.clone());
                    self.events.push(SyncEvent::PeerPresence(presence));
                }
                Ok(())
            }
            ServerMessage::PresenceLeave { user_id } => {
                if self.roster.remove(&user_id).is_some() {
                    log::info!("{} left", user_id);
                }
                self.events.push(SyncEvent::PeerLeft { user_id });
                Ok(())
            }
            ServerMessage::Error { message } => Err(CollaborativeError::Rejected(message)),
        }
    }

    fn apply_event(
        &mut self,
        event: BroadcastEvent,
        state: &mut CanvasState,
    ) -> Result<(), CollaborativeError> {
        if event.user_id == self.identity.user_id {
            log::debug!("Ignoring echo of {}", event.event_id);
            return Ok(());
        }
        if !self.recent.insert(&event.event_id) {
            log::debug!("Ignoring duplicate event {}", event.event_id);
            return Ok(());
        }
        log::debug!("Applying {} from {}", event.payload.name(), event.user_id);

        match event.payload {
            EventPayload::StrokeAdd { strokes } => {
                state.apply_remote(|s| {
                    for stroke in strokes {
                        s.add_stroke(stroke);
                    }
                });
            }
            EventPayload::StrokeUndo { stroke_id } => {
                state.apply_remote(|s| s.remove_stroke(&stroke_id));
            }
            EventPayload::CanvasClear => {
                state.apply_remote(|s| s.clear());
                self.stroke_batch.clear();
                self.batch_started = None;
                self.pending_uploads.clear();
                self.unannounced.clear();
                self.pending_fetches.clear();
                self.events.push(SyncEvent::RemoteCleared {
                    user_id: event.user_id,
                });
            }
            EventPayload::ImageAdd { image } => {
                if state.contains_image(&image.id) {
                    let transform = image.transform();
                    state
                        .apply_remote(|s| s.set_transform(&image.id, transform))
                        .map_err(|e| CollaborativeError::Unexpected(e.to_string()))?;
                } else if let Some(pending) =
                    self.pending_fetches.iter_mut().find(|p| p.id == image.id)
                {
                    *pending = image;
                } else {
                    self.pending_fetches.push(image);
                }
            }
            EventPayload::ImageUpdate {
                id,
                transform_matrix,
            } => {
                if state.contains_image(&id) {
                    let transform = crate::viewport::from_matrix4(&transform_matrix);
                    state
                        .apply_remote(|s| s.set_transform(&id, transform))
                        .map_err(|e| CollaborativeError::Unexpected(e.to_string()))?;
                } else if let Some(pending) = self.pending_fetches.iter_mut().find(|p| p.id == id) {
                    pending.transform_matrix = transform_matrix;
                } else {
                    log::debug!("Update for unknown image {}", id);
                }
            }
            EventPayload::ImageDelete { id } => {
                self.pending_fetches.retain(|p| p.id != id);
                if state.contains_image(&id) {
                    let _ = state.apply_remote(|s| s.remove_image(&id));
                }
            }
            EventPayload::CanvasSettings { settings } => {
                state.apply_remote(|s| s.set_settings(settings));
            }
        }
        Ok(())
    }

    /// A remote image's bitmap arrived. Inserts it on top, or just applies the
    /// transform if it is already present.
    pub fn complete_fetch(
        &mut self,
        state: &mut CanvasState,
        descriptor: ImageDescriptor,
        bitmap: Bitmap,
    ) -> Result<(), CanvasError> {
        let transform = descriptor.transform();
        if state.contains_image(&descriptor.id) {
            return state.apply_remote(|s| s.set_transform(&descriptor.id, transform));
        }
        let image = CanvasImage::new(descriptor.id, bitmap)
            .with_transform(transform)?
            .with_url(descriptor.url);
        state.apply_remote(|s| s.insert_image(image, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{Canvas, CanvasSettings};
    use crate::collab::transport::{ChannelHandle, local_channel};
    use crate::command::Command;
    use crate::strokes::StrokeKind;
    use crate::viewport::to_matrix4;
    use kurbo::Affine;
    use std::time::Duration;

    fn identity(user: &str) -> Identity {
        Identity::new(user, user.to_uppercase(), SerializableColor::new(0, 0, 255, 255), "editor")
    }

    fn connected(user: &str, state: &mut CanvasState, now: Instant) -> (Synchronizer, ChannelHandle) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut sync = Synchronizer::new(SyncConfig::default(), identity(user), state);
        let (transport, handle) = local_channel();
        sync.attach(Box::new(transport));
        handle.push(TransportEvent::Connected);
        sync.poll(state, now);
        handle.take_sent();
        sync.take_events();
        (sync, handle)
    }

    fn stroke(id: &str, author: &str) -> Stroke {
        Stroke::new(StrokeKind::Normal, SerializableColor::black(), 2.0, 1.0)
            .with_id(id)
            .with_author(author)
            .with_points(vec![Point::new(0.0, 0.0), Point::new(5.0, 5.0)])
    }

    fn remote_frame(user: &str, event_id: &str, payload: EventPayload) -> String {
        let mut event = BroadcastEvent::new(user, payload);
        event.event_id = event_id.to_string();
        serde_json::to_string(&ServerMessage::Broadcast { event }).unwrap()
    }

    fn event_types(frames: &[String]) -> Vec<String> {
        frames
            .iter()
            .map(|f| {
                let v: serde_json::Value = serde_json::from_str(f).unwrap();
                match v["type"].as_str().unwrap() {
                    "broadcast" => v["event"]["type"].as_str().unwrap().to_string(),
                    other => other.to_string(),
                }
            })
            .collect()
    }

    #[test]
    fn test_connect_announces_presence() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let mut sync = Synchronizer::new(SyncConfig::default(), identity("alice"), &mut state);
        let (transport, handle) = local_channel();
        sync.attach(Box::new(transport));
        assert_eq!(sync.connection_state(), ConnectionState::Connecting);

        handle.push(TransportEvent::Connected);
        sync.poll(&mut state, now);
        assert!(sync.is_connected());
        assert_eq!(event_types(&handle.take_sent()), vec!["update-presence"]);
        assert_eq!(
            sync.take_events(),
            vec![
                SyncEvent::StatusChanged(ConnectionState::Connecting),
                SyncEvent::StatusChanged(ConnectionState::Connected),
            ]
        );
    }

    #[test]
    fn test_strokes_are_batched() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);

        state.add_stroke(stroke("s1", "alice"));
        sync.observe(&mut state, now);
        state.add_stroke(stroke("s2", "alice"));
        sync.observe(&mut state, now + Duration::from_millis(10));
        sync.tick(now + Duration::from_millis(20));
        assert!(handle.take_sent().is_empty());

        sync.tick(now + Duration::from_millis(30));
        let sent = handle.take_sent();
        assert_eq!(sent.len(), 1);
        let v: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(v["event"]["strokes"].as_array().unwrap().len(), 2);
        assert_eq!(v["event"]["userName"], "ALICE");
    }

    #[test]
    fn test_echo_is_suppressed() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);

        state.add_stroke(stroke("s1", "alice"));
        sync.observe(&mut state, now);
        sync.flush_strokes(now);
        let sent = handle.take_sent();
        assert_eq!(sent.len(), 1);

        // The relay should not echo, but a misbehaving one must not duplicate strokes.
        handle.deliver(sent[0].clone());
        sync.poll(&mut state, now);
        assert_eq!(state.strokes().len(), 1);
    }

    #[test]
    fn test_remote_strokes_apply_once() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        let frame = remote_frame("bob", "e1", EventPayload::StrokeAdd { strokes: vec![stroke("s9", "bob")] });

        handle.deliver(frame.clone());
        handle.deliver(frame);
        sync.poll(&mut state, now);
        assert_eq!(state.strokes().len(), 1);

        // Remote changes are not re-broadcast.
        sync.observe(&mut state, now);
        sync.flush_strokes(now);
        assert!(handle.take_sent().is_empty());
    }

    #[test]
    fn test_remote_stroke_undo() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        handle.deliver(remote_frame("bob", "e1", EventPayload::StrokeAdd { strokes: vec![stroke("s9", "bob")] }));
        handle.deliver(remote_frame("bob", "e2", EventPayload::StrokeUndo { stroke_id: "s9".into() }));
        sync.poll(&mut state, now);
        assert!(state.strokes().is_empty());
    }

    #[test]
    fn test_local_stroke_undo_is_broadcast() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);

        state.add_stroke(stroke("s1", "alice"));
        sync.observe(&mut state, now);
        sync.flush_strokes(now);
        handle.take_sent();

        state.undo_last_stroke("alice");
        sync.observe(&mut state, now);
        let sent = handle.take_sent();
        assert_eq!(event_types(&sent), vec!["stroke-undo"]);
        assert!(sent[0].contains("\"strokeId\":\"s1\""));
    }

    #[test]
    fn test_undo_before_flush_never_sends() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        state.add_stroke(stroke("s1", "alice"));
        state.undo_last_stroke("alice");
        sync.observe(&mut state, now);
        sync.tick(now + Duration::from_secs(1));
        assert!(handle.take_sent().is_empty());
    }

    #[test]
    fn test_last_image_update_wins() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        let image = CanvasImage::new("img", Bitmap::solid(4, 4, [0, 0, 0, 255]).unwrap());
        state.apply_remote(|s| s.insert_image(image, None)).unwrap();

        let t1 = Affine::translate((10.0, 0.0));
        let t2 = Affine::translate((0.0, 40.0));
        handle.deliver(remote_frame("bob", "e1", EventPayload::ImageUpdate { id: "img".into(), transform_matrix: to_matrix4(t1) }));
        handle.deliver(remote_frame("carol", "e2", EventPayload::ImageUpdate { id: "img".into(), transform_matrix: to_matrix4(t2) }));
        sync.poll(&mut state, now);
        assert_eq!(state.image("img").unwrap().transform(), t2);
    }

    #[test]
    fn test_remote_image_add_is_fetched_with_latest_transform() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        let t1 = Affine::translate((1.0, 1.0));
        let t2 = Affine::translate((2.0, 2.0));
        let descriptor = ImageDescriptor {
            id: "img".into(),
            url: "memory://img.png".into(),
            transform_matrix: to_matrix4(t1),
            width: 4,
            height: 4,
        };
        handle.deliver(remote_frame("bob", "e1", EventPayload::ImageAdd { image: descriptor }));
        handle.deliver(remote_frame("bob", "e2", EventPayload::ImageUpdate { id: "img".into(), transform_matrix: to_matrix4(t2) }));
        sync.poll(&mut state, now);
        assert!(!state.contains_image("img"));

        let fetches = sync.take_pending_fetches();
        assert_eq!(fetches.len(), 1);
        let bitmap = Bitmap::solid(4, 4, [0, 0, 0, 255]).unwrap();
        sync.complete_fetch(&mut state, fetches[0].clone(), bitmap).unwrap();
        let image = state.image("img").unwrap();
        assert_eq!(image.transform(), t2);
        assert_eq!(image.url.as_deref(), Some("memory://img.png"));
    }

    #[test]
    fn test_local_image_waits_for_upload() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        let image = CanvasImage::new("img", Bitmap::solid(4, 4, [0, 0, 0, 255]).unwrap());
        state.insert_image(image, None).unwrap();
        state.set_transform("img", Affine::translate((3.0, 0.0))).unwrap();
        sync.observe(&mut state, now);
        assert!(handle.take_sent().is_empty());
        assert_eq!(sync.take_pending_uploads(), vec!["img".to_string()]);

        sync.announce_image(&mut state, "img", "memory://img.png", now).unwrap();
        let sent = handle.take_sent();
        assert_eq!(event_types(&sent), vec!["image-add"]);
        let v: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(v["event"]["image"]["url"], "memory://img.png");
        assert_eq!(v["event"]["image"]["transformMatrix"][12], 3.0);

        // Once announced, moves go out as updates and are coalesced per drain.
        state.set_transform("img", Affine::translate((4.0, 0.0))).unwrap();
        state.set_transform("img", Affine::translate((5.0, 0.0))).unwrap();
        state.remove_image("img").unwrap();
        sync.observe(&mut state, now);
        assert_eq!(event_types(&handle.take_sent()), vec!["image-delete"]);
    }

    #[test]
    fn test_transform_updates_coalesce() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        let image = CanvasImage::new("img", Bitmap::solid(4, 4, [0, 0, 0, 255]).unwrap())
            .with_url("memory://img.png");
        state.insert_image(image, None).unwrap();
        sync.observe(&mut state, now);
        handle.take_sent();

        for x in 1..=5 {
            state.set_transform("img", Affine::translate((x as f64, 0.0))).unwrap();
        }
        sync.observe(&mut state, now);
        let sent = handle.take_sent();
        assert_eq!(event_types(&sent), vec!["image-update"]);
        let v: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(v["event"]["transformMatrix"][12], 5.0);
    }

    #[test]
    fn test_rate_limit_drops_excess() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        for i in 0..60 {
            state.set_settings(CanvasSettings {
                background: SerializableColor::new(i, 0, 0, 255),
                grid: false,
            });
            sync.observe(&mut state, now);
        }
        assert_eq!(handle.take_sent().len(), 50);

        state.set_settings(CanvasSettings::default());
        sync.observe(&mut state, now + Duration::from_secs(1));
        assert_eq!(handle.take_sent().len(), 1);
    }

    #[test]
    fn test_remote_clear_keeps_connection() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        state.add_stroke(stroke("s1", "alice"));
        state.insert_image(CanvasImage::new("img", Bitmap::solid(2, 2, [0, 0, 0, 255]).unwrap()), None).unwrap();
        sync.observe(&mut state, now);

        handle.deliver(remote_frame("bob", "e1", EventPayload::CanvasClear));
        sync.poll(&mut state, now);
        assert!(state.is_empty());
        assert!(sync.is_connected());
        assert!(!handle.is_closed());
        assert!(sync.take_events().contains(&SyncEvent::RemoteCleared { user_id: "bob".into() }));

        // The cleared stroke must not be sent after the fact.
        sync.tick(now + Duration::from_secs(1));
        assert!(handle.take_sent().is_empty());
    }

    #[test]
    fn test_image_deleted_mid_upload_is_never_announced() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        let image = CanvasImage::new("img", Bitmap::solid(4, 4, [0, 0, 0, 255]).unwrap());
        state.insert_image(image, None).unwrap();
        sync.observe(&mut state, now);
        assert_eq!(sync.take_pending_uploads(), vec!["img".to_string()]);

        // The upload is in flight: moves and deletion stay local.
        state.set_transform("img", Affine::translate((7.0, 0.0))).unwrap();
        sync.observe(&mut state, now);
        state.remove_image("img").unwrap();
        sync.observe(&mut state, now);
        assert!(handle.take_sent().is_empty());

        assert!(sync.announce_image(&mut state, "img", "memory://img.png", now).is_err());
        assert!(handle.take_sent().is_empty());
    }

    #[test]
    fn test_move_during_upload_is_carried_by_announcement() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        let image = CanvasImage::new("img", Bitmap::solid(4, 4, [0, 0, 0, 255]).unwrap());
        state.insert_image(image, None).unwrap();
        sync.observe(&mut state, now);
        sync.take_pending_uploads();

        state.set_transform("img", Affine::translate((7.0, 0.0))).unwrap();
        sync.observe(&mut state, now);
        assert!(handle.take_sent().is_empty());

        sync.announce_image(&mut state, "img", "memory://img.png", now).unwrap();
        let sent = handle.take_sent();
        assert_eq!(event_types(&sent), vec!["image-add"]);
        let v: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(v["event"]["image"]["transformMatrix"][12], 7.0);
    }

    #[test]
    fn test_remote_clear_drops_local_history() {
        let mut canvas = Canvas::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", canvas.state_mut(), now);
        let image = CanvasImage::new("a", Bitmap::solid(2, 2, [0, 0, 0, 255]).unwrap())
            .with_url("memory://a.png");
        canvas.execute(Command::add_images(vec![image])).unwrap();
        sync.observe(canvas.state_mut(), now);
        let removal = Command::remove_images(canvas.state(), &["a".to_string()]).unwrap();
        canvas.execute(removal).unwrap();
        sync.observe(canvas.state_mut(), now);
        assert_eq!(event_types(&handle.take_sent()), vec!["image-add", "image-delete"]);

        handle.deliver(remote_frame("bob", "e1", EventPayload::CanvasClear));
        sync.poll(canvas.state_mut(), now);
        assert!(!canvas.can_undo());
        assert!(!canvas.undo());
        assert!(!canvas.redo());
        assert!(canvas.state().images().is_empty());

        // Nothing the peer cleared comes back to the room.
        sync.observe(canvas.state_mut(), now);
        assert!(handle.take_sent().is_empty());

        // New edits after the clear are undoable as usual.
        let image = CanvasImage::new("b", Bitmap::solid(2, 2, [0, 0, 0, 255]).unwrap());
        canvas.execute(Command::add_images(vec![image])).unwrap();
        assert!(canvas.can_undo());
    }

    #[test]
    fn test_remote_stroke_undo_leaves_image_history() {
        let mut canvas = Canvas::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", canvas.state_mut(), now);
        let image = CanvasImage::new("a", Bitmap::solid(2, 2, [0, 0, 0, 255]).unwrap());
        canvas.execute(Command::add_images(vec![image])).unwrap();

        handle.deliver(remote_frame("bob", "e1", EventPayload::StrokeAdd { strokes: vec![stroke("s9", "bob")] }));
        handle.deliver(remote_frame("bob", "e2", EventPayload::StrokeUndo { stroke_id: "s9".into() }));
        sync.poll(canvas.state_mut(), now);
        assert!(canvas.state().strokes().is_empty());

        assert!(canvas.can_undo());
        assert!(canvas.undo());
        assert!(canvas.state().images().is_empty());
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        handle.deliver("{not json");
        handle.deliver(r#"{"type":"broadcast","event":{"type":"image-update","eventId":"e","userId":"bob","timestamp":1}}"#);
        handle.deliver(remote_frame("bob", "e1", EventPayload::StrokeAdd { strokes: vec![stroke("s1", "bob")] }));
        sync.poll(&mut state, now);
        assert!(sync.is_connected());
        assert_eq!(state.strokes().len(), 1);
        assert!(sync.handle_message("[]", &mut state).is_err());
    }

    #[test]
    fn test_presence_roster() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        let mut bob = Presence::new("bob", "Bob", SerializableColor::black(), "viewer");
        bob.cursor = Some(Point::new(4.0, 2.0));
        handle.deliver(serde_json::to_string(&ServerMessage::Presence { presence: bob.clone() }).unwrap());
        sync.poll(&mut state, now);
        assert_eq!(sync.roster().get("bob"), Some(&bob));

        handle.deliver(r#"{"type":"presence-leave","userId":"bob"}"#);
        sync.poll(&mut state, now);
        assert!(sync.roster().is_empty());
        let events = sync.take_events();
        assert_eq!(events.last(), Some(&SyncEvent::PeerLeft { user_id: "bob".into() }));
    }

    #[test]
    fn test_presence_is_throttled() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);

        sync.update_presence(Some(Point::new(1.0, 1.0)), None, false);
        sync.tick(now + Duration::from_millis(10));
        assert!(handle.take_sent().is_empty());

        sync.update_presence(Some(Point::new(2.0, 2.0)), Some("pen".into()), true);
        sync.tick(now + Duration::from_millis(50));
        let sent = handle.take_sent();
        assert_eq!(sent.len(), 1);
        let v: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(v["presence"]["cursor"]["x"], 2.0);
        assert_eq!(v["presence"]["isDrawing"], true);

        sync.tick(now + Duration::from_millis(200));
        assert!(handle.take_sent().is_empty());
    }

    #[test]
    fn test_reconnect_backoff_then_failure() {
        let mut state = CanvasState::new();
        let start = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, start);
        handle.push(TransportEvent::Closed);
        sync.poll(&mut state, start);

        let mut now = start;
        let mut delays = Vec::new();
        while sync.connection_state() == ConnectionState::Reconnecting {
            let at = sync.next_reconnect_at().unwrap();
            delays.push(at - now);
            assert!(!sync.reconnect_due(at - Duration::from_millis(1)));
            assert!(sync.reconnect_due(at));
            now = at;
            sync.begin_connect();
            sync.on_connection_lost(now);
        }
        let ms: Vec<u128> = delays.iter().map(|d| d.as_millis()).collect();
        assert_eq!(ms, vec![500, 1000, 2000, 4000, 8000]);
        assert_eq!(sync.connection_state(), ConnectionState::Error);
        assert!(sync.take_events().contains(&SyncEvent::ConnectionFailed { attempts: 5 }));
    }

    #[test]
    fn test_rejoin_after_failure_gets_fresh_retries() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        handle.push(TransportEvent::Closed);
        sync.poll(&mut state, now);
        while sync.connection_state() == ConnectionState::Reconnecting {
            sync.begin_connect();
            sync.on_connection_lost(now);
        }
        assert_eq!(sync.connection_state(), ConnectionState::Error);
        sync.take_events();

        sync.begin_connect();
        sync.on_connection_lost(now);
        assert_eq!(sync.connection_state(), ConnectionState::Reconnecting);
        assert_eq!(sync.next_reconnect_at(), Some(now + Duration::from_millis(500)));
        assert!(!sync
            .take_events()
            .iter()
            .any(|e| matches!(e, SyncEvent::ConnectionFailed { .. })));
    }

    #[test]
    fn test_offline_frames_replay_on_reconnect() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        handle.push(TransportEvent::Error("reset".into()));
        sync.poll(&mut state, now);
        assert_eq!(sync.connection_state(), ConnectionState::Reconnecting);

        state.set_settings(CanvasSettings { background: SerializableColor::black(), grid: true });
        sync.observe(&mut state, now);
        assert_eq!(sync.queued(), 1);

        let (transport, next) = local_channel();
        sync.attach(Box::new(transport));
        next.push(TransportEvent::Connected);
        sync.poll(&mut state, now + Duration::from_secs(1));
        assert_eq!(event_types(&next.take_sent()), vec!["update-presence", "canvas-settings"]);
        assert_eq!(sync.queued(), 0);

        // Counter was reset by the successful reconnect.
        next.push(TransportEvent::Closed);
        sync.poll(&mut state, now + Duration::from_secs(2));
        assert_eq!(
            sync.next_reconnect_at(),
            Some(now + Duration::from_secs(2) + Duration::from_millis(500))
        );
    }

    #[test]
    fn test_auth_failure_is_terminal() {
        let mut state = CanvasState::new();
        let mut sync = Synchronizer::new(SyncConfig::default(), identity("alice"), &mut state);
        sync.begin_connect();
        sync.on_auth_failed("expired");
        assert_eq!(sync.connection_state(), ConnectionState::Error);
        assert!(!sync.reconnect_due(Instant::now() + Duration::from_secs(60)));
        assert!(sync.take_events().contains(&SyncEvent::AuthFailed("expired".into())));
    }

    #[test]
    fn test_disconnect_cancels_timers() {
        let mut state = CanvasState::new();
        let now = Instant::now();
        let (mut sync, handle) = connected("alice", &mut state, now);
        state.add_stroke(stroke("s1", "alice"));
        sync.observe(&mut state, now);
        sync.disconnect();
        assert!(handle.is_closed());
        sync.tick(now + Duration::from_secs(1));
        assert_eq!(sync.queued(), 0);
        assert_eq!(sync.connection_state(), ConnectionState::Disconnected);

        sync.detach(&mut state);
    }
}
