//! Collaboration session: the async half of the synchronizer.
//!
//! Acquires tokens, opens channels, moves image bytes through the blob store
//! and drives reconnection. Everything that suspends lives here; the
//! [`Synchronizer`] itself stays synchronous.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::canvas::CanvasState;
use crate::collab::services::{BlobStore, TokenProvider, TokenRequest, blob_path};
use crate::collab::synchronizer::{ConnectionState, Identity, Synchronizer};
use crate::collab::transport::ChannelConnector;
use crate::config::SyncConfig;
use crate::error::{CanvasError, ErrorReporter, InkboardError, InkboardResult, NetworkError};
use crate::image::Bitmap;

/// How often the connect loop polls a transport that has not opened yet.
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Services a session talks to, injected at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub tokens: Arc<dyn TokenProvider>,
    pub connector: Arc<dyn ChannelConnector>,
    pub blobs: Arc<dyn BlobStore>,
    pub reporter: Arc<dyn ErrorReporter>,
}

/// Current time on the runtime clock, so paused-clock tests see virtual time.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

pub struct CollabSession {
    room: String,
    user_token: Option<String>,
    config: SyncConfig,
    services: Collaborators,
    sync: Synchronizer,
}

impl CollabSession {
    pub fn new(
        room: impl Into<String>,
        identity: Identity,
        config: SyncConfig,
        services: Collaborators,
        state: &mut CanvasState,
    ) -> Self {
        Self {
            room: room.into(),
            user_token: None,
            sync: Synchronizer::new(config.clone(), identity, state),
            config,
            services,
        }
    }

    /// Credential of the signed-in user, forwarded to the token service.
    pub fn with_user_token(mut self, token: impl Into<String>) -> Self {
        self.user_token = Some(token.into());
        self
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.sync
    }

    pub fn synchronizer_mut(&mut self) -> &mut Synchronizer {
        &mut self.sync
    }

    fn token_request(&self) -> TokenRequest {
        let identity = self.sync.identity();
        TokenRequest {
            room: self.room.clone(),
            user_id: identity.user_id.clone(),
            user_name: identity.user_name.clone(),
            user_color: identity.color.to_hex(),
            user_role: identity.role.clone(),
            user_token: self.user_token.clone(),
        }
    }

    /// Fetch a token, retrying transient failures with a linearly growing pause.
    /// Auth rejections are returned immediately.
    async fn acquire_token(&self) -> InkboardResult<String> {
        let request = self.token_request();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.config.token_timeout,
                self.services.tokens.get_token(&request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Timeout(millis(self.config.token_timeout)).into()),
            };

            match result {
                Ok(token) => return Ok(token),
                Err(InkboardError::Auth(e)) => return Err(e.into()),
                Err(e) if attempt < self.config.token_retries => {
                    let pause = self.config.token_retry_delay * attempt;
                    log::warn!(
                        "Token request failed (attempt {}): {}; retrying in {} ms",
                        attempt,
                        e,
                        pause.as_millis()
                    );
                    tokio::time::sleep(pause).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Open the channel and wait, bounded by the connect timeout, until it reports open.
    async fn open_channel(&mut self, token: &str, state: &mut CanvasState) -> InkboardResult<()> {
        let transport = match self.services.connector.connect(token) {
            Ok(transport) => transport,
            Err(e) => {
                self.sync.on_connection_lost(now());
                return Err(e.into());
            }
        };
        self.sync.attach(transport);

        let deadline = tokio::time::Instant::now() + self.config.connect_timeout;
        loop {
            self.sync.poll(state, now());
            match self.sync.connection_state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => {}
                _ => return Err(NetworkError::Connect("channel closed while opening".into()).into()),
            }
            if tokio::time::Instant::now() >= deadline {
                log::warn!("Channel did not open within {} ms", millis(self.config.connect_timeout));
                self.sync.on_connection_lost(now());
                return Err(NetworkError::Timeout(millis(self.config.connect_timeout)).into());
            }
            tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
        }
    }

    /// Token, then channel. Auth failures end in `Error` with no retry; anything
    /// else leaves a reconnection scheduled.
    pub async fn join(&mut self, state: &mut CanvasState) -> InkboardResult<()> {
        log::info!("Joining room {}", self.room);
        self.sync.begin_connect();
        let token = match self.acquire_token().await {
            Ok(token) => token,
            Err(InkboardError::Auth(e)) => {
                self.sync.on_auth_failed(e.to_string());
                return Err(e.into());
            }
            Err(e) => {
                self.sync.on_connection_lost(now());
                return Err(e);
            }
        };
        self.open_channel(&token, state).await
    }

    /// One turn of the event loop: inbound, outbound, timers, reconnection and
    /// image transfers. Errors are reported, never returned.
    pub async fn pump(&mut self, state: &mut CanvasState) {
        let at = now();
        self.sync.poll(state, at);
        self.sync.observe(state, at);
        self.sync.tick(at);

        if self.sync.reconnect_due(at) {
            log::info!("Reconnecting to room {}", self.room);
            if let Err(e) = self.join(state).await {
                self.services.reporter.report(&e);
            }
        }

        self.upload_pending(state).await;
        self.fetch_pending(state).await;
    }

    /// Upload bitmaps of locally added images, then announce them.
    async fn upload_pending(&mut self, state: &mut CanvasState) {
        for id in self.sync.take_pending_uploads() {
            if let Err(e) = self.share_image(state, &id).await {
                self.services.reporter.report(&e);
            }
        }
    }

    async fn share_image(&mut self, state: &mut CanvasState, id: &str) -> InkboardResult<()> {
        let image = state
            .image(id)
            .ok_or_else(|| CanvasError::UnknownImage(id.to_string()))?;
        let (bytes, format) = image.bitmap().encoded()?;
        let bytes = bytes.into_owned();
        let path = blob_path(&self.room, &self.sync.identity().user_id, image.id(), format);

        let url = self
            .services
            .blobs
            .upload(&path, bytes, format.mime_type())
            .await?;
        log::debug!("Uploaded {} to {}", id, url);

        // The image may have been deleted while the upload was in flight.
        if state.contains_image(id) {
            self.sync.announce_image(state, id, &url, now())?;
        }
        Ok(())
    }

    /// Download and insert images announced by peers.
    async fn fetch_pending(&mut self, state: &mut CanvasState) {
        for descriptor in self.sync.take_pending_fetches() {
            let result: InkboardResult<()> = async {
                let bytes = self.services.blobs.download(&descriptor.url).await?;
                let bitmap = Bitmap::decode(&bytes)?;
                self.sync.complete_fetch(state, descriptor, bitmap)?;
                Ok(())
            }
            .await;
            if let Err(e) = result {
                self.services.reporter.report(&e);
            }
        }
    }

    /// Disconnect, cancel timers and stop observing the canvas.
    pub fn leave(self, state: &mut CanvasState) {
        log::info!("Leaving room {}", self.room);
        self.sync.detach(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::services::MemoryBlobStore;
    use crate::collab::synchronizer::SyncEvent;
    use crate::collab::transport::{ChannelConnectorStub, ChannelHandle, TransportEvent};
    use crate::error::{AuthError, RecordingErrorReporter};
    use crate::image::CanvasImage;
    use crate::strokes::SerializableColor;
    use crate::BoxFuture;
    use kurbo::Affine;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Token provider that replays scripted answers, then keeps issuing tokens.
    #[derive(Default)]
    struct ScriptedTokens {
        script: Mutex<VecDeque<InkboardResult<String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTokens {
        fn new(script: Vec<InkboardResult<String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenProvider for ScriptedTokens {
        fn get_token(&self, _request: &TokenRequest) -> BoxFuture<'_, InkboardResult<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("token".to_string()));
            Box::pin(async move { next })
        }
    }

    struct Fixture {
        session: CollabSession,
        state: CanvasState,
        tokens: Arc<ScriptedTokens>,
        connector: ChannelConnectorStub,
        reporter: Arc<RecordingErrorReporter>,
    }

    fn fixture(user: &str, tokens: Arc<ScriptedTokens>, blobs: Arc<MemoryBlobStore>) -> Fixture {
        let mut state = CanvasState::new();
        let connector = ChannelConnectorStub::new();
        let reporter = Arc::new(RecordingErrorReporter::new());
        let services = Collaborators {
            tokens: tokens.clone(),
            connector: Arc::new(connector.clone()),
            blobs,
            reporter: reporter.clone(),
        };
        let identity = Identity::new(user, user, SerializableColor::black(), "editor");
        let session = CollabSession::new("room-1", identity, SyncConfig::default(), services, &mut state);
        Fixture {
            session,
            state,
            tokens,
            connector,
            reporter,
        }
    }

    fn open_channel(connector: &ChannelConnectorStub) -> ChannelHandle {
        let handle = connector.prepare();
        handle.push(TransportEvent::Connected);
        handle
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_retries_transient_token_failures() {
        let tokens = ScriptedTokens::new(vec![
            Err(NetworkError::Timeout(10).into()),
            Err(NetworkError::Http("502".into()).into()),
        ]);
        let mut f = fixture("alice", tokens, Arc::new(MemoryBlobStore::new()));
        let server = open_channel(&f.connector);

        let started = tokio::time::Instant::now();
        f.session.join(&mut f.state).await.unwrap();
        assert_eq!(f.tokens.calls(), 3);
        // 500 ms after the first failure, 1000 ms after the second.
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert!(f.session.synchronizer().is_connected());

        let sent = server.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("update-presence"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_is_not_retried() {
        let tokens = ScriptedTokens::new(vec![Err(AuthError::Rejected("expired".into()).into())]);
        let mut f = fixture("alice", tokens, Arc::new(MemoryBlobStore::new()));

        let err = f.session.join(&mut f.state).await.unwrap_err();
        assert!(matches!(err, InkboardError::Auth(_)));
        assert!(!err.is_recoverable());
        assert_eq!(f.tokens.calls(), 1);
        assert_eq!(f.session.synchronizer().connection_state(), ConnectionState::Error);
        let events = f.session.synchronizer_mut().take_events();
        assert!(events.iter().any(|e| matches!(e, SyncEvent::AuthFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_retries_are_bounded() {
        let tokens = ScriptedTokens::new(vec![
            Err(NetworkError::Closed.into()),
            Err(NetworkError::Closed.into()),
            Err(NetworkError::Closed.into()),
        ]);
        let mut f = fixture("alice", tokens, Arc::new(MemoryBlobStore::new()));

        let err = f.session.join(&mut f.state).await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(f.tokens.calls(), 3);
        assert_eq!(
            f.session.synchronizer().connection_state(),
            ConnectionState::Reconnecting
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let mut f = fixture("alice", ScriptedTokens::new(vec![]), Arc::new(MemoryBlobStore::new()));
        let _silent = f.connector.prepare();

        let err = f.session.join(&mut f.state).await.unwrap_err();
        assert_eq!(err, InkboardError::Network(NetworkError::Timeout(15_000)));
        assert_eq!(
            f.session.synchronizer().connection_state(),
            ConnectionState::Reconnecting
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_reconnects_after_backoff() {
        let mut f = fixture("alice", ScriptedTokens::new(vec![]), Arc::new(MemoryBlobStore::new()));
        let first = open_channel(&f.connector);
        f.session.join(&mut f.state).await.unwrap();

        first.push(TransportEvent::Closed);
        f.session.pump(&mut f.state).await;
        assert_eq!(
            f.session.synchronizer().connection_state(),
            ConnectionState::Reconnecting
        );

        let second = open_channel(&f.connector);
        f.session.pump(&mut f.state).await;
        assert!(second.take_sent().is_empty(), "reconnected before the backoff elapsed");

        tokio::time::sleep(Duration::from_millis(500)).await;
        f.session.pump(&mut f.state).await;
        assert!(f.session.synchronizer().is_connected());
        assert_eq!(f.tokens.calls(), 2);
        assert!(second.take_sent()[0].contains("update-presence"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_reaches_peer_through_blob_store() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let mut alice = fixture("alice", ScriptedTokens::new(vec![]), blobs.clone());
        let mut bob = fixture("bob", ScriptedTokens::new(vec![]), blobs.clone());
        let to_alice = open_channel(&alice.connector);
        let to_bob = open_channel(&bob.connector);
        alice.session.join(&mut alice.state).await.unwrap();
        bob.session.join(&mut bob.state).await.unwrap();
        to_alice.take_sent();

        let placed = Affine::translate((30.0, 40.0));
        let image = CanvasImage::new("photo", Bitmap::solid(3, 2, [9, 8, 7, 255]).unwrap())
            .with_transform(placed)
            .unwrap();
        alice.state.insert_image(image, None).unwrap();
        alice.session.pump(&mut alice.state).await;
        assert_eq!(blobs.len(), 1);
        assert_eq!(
            alice.state.image("photo").unwrap().url.as_deref(),
            Some("memory://rooms/room-1/users/alice/images/photo.png")
        );

        // Relay the announcement to bob.
        for frame in to_alice.take_sent() {
            to_bob.deliver(frame);
        }
        bob.session.pump(&mut bob.state).await;
        let received = bob.state.image("photo").unwrap();
        assert_eq!(received.transform(), placed);
        assert_eq!((received.bitmap().width(), received.bitmap().height()), (3, 2));
        assert!(bob.reporter.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_blob_is_reported() {
        let mut f = fixture("bob", ScriptedTokens::new(vec![]), Arc::new(MemoryBlobStore::new()));
        let server = open_channel(&f.connector);
        f.session.join(&mut f.state).await.unwrap();

        server.deliver(
            r#"{"type":"broadcast","event":{"type":"image-add","eventId":"e1","userId":"alice","timestamp":1,
                "image":{"id":"gone","url":"memory://gone.png","transformMatrix":[1,0,0,0,0,1,0,0,0,0,1,0,0,0,0,1],"width":1,"height":1}}}"#,
        );
        f.session.pump(&mut f.state).await;
        assert!(!f.state.contains_image("gone"));
        assert_eq!(f.reporter.errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_closes_channel() {
        let mut f = fixture("alice", ScriptedTokens::new(vec![]), Arc::new(MemoryBlobStore::new()));
        let server = open_channel(&f.connector);
        f.session.join(&mut f.state).await.unwrap();
        f.session.leave(&mut f.state);
        assert!(server.is_closed());
    }
}
