//! Real-time channel transports.
//!
//! A transport is polled, never awaited: the synchronizer drains
//! [`ChannelTransport::poll_events`] once per tick on the UI thread. The native
//! WebSocket client does its blocking I/O on a background thread.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::NetworkError;

/// Something that happened on the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    /// A text frame from the server.
    Message(String),
    /// The connection closed (cleanly or not).
    Closed,
    Error(String),
}

/// A bidirectional text channel.
pub trait ChannelTransport: Send {
    fn send(&mut self, text: &str) -> Result<(), NetworkError>;

    /// Drain everything received since the last poll (non-blocking).
    fn poll_events(&mut self) -> Vec<TransportEvent>;

    fn close(&mut self);
}

/// Opens transports for a channel URL and token.
pub trait ChannelConnector: Send + Sync {
    fn connect(&self, token: &str) -> Result<Box<dyn ChannelTransport>, NetworkError>;
}

// ============================================================================
// Native WebSocket Client
// ============================================================================

mod native_client {
    use super::*;
    use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;
    use tungstenite::{Message, connect};
    use url::Url;

    /// Commands sent to the WebSocket thread.
    enum WsCommand {
        Send(String),
        Close,
    }

    /// WebSocket client backed by `tungstenite` on a background thread.
    pub struct NativeWebSocket {
        /// Channel to send commands to the WebSocket thread.
        cmd_tx: Option<Sender<WsCommand>>,
        /// Channel to receive events from the WebSocket thread.
        event_rx: Option<Receiver<TransportEvent>>,
        _thread: Option<JoinHandle<()>>,
    }

    impl NativeWebSocket {
        /// Start connecting to `url`. Progress is reported through `poll_events`.
        pub fn connect(url: &str) -> Result<Self, NetworkError> {
            let parsed_url =
                Url::parse(url).map_err(|e| NetworkError::InvalidUrl(e.to_string()))?;
            if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
                return Err(NetworkError::InvalidUrl(format!(
                    "Invalid WebSocket URL scheme: {}",
                    parsed_url.scheme()
                )));
            }

            let (cmd_tx, cmd_rx) = channel::<WsCommand>();
            let (event_tx, event_rx) = channel::<TransportEvent>();
            let url = url.to_string();

            let handle = thread::spawn(move || {
                log::info!("WebSocket thread: connecting");
                let (mut socket, response) = match connect(&url) {
                    Ok(ok) => ok,
                    Err(e) => {
                        log::error!("WebSocket connection failed: {}", e);
                        let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                };
                log::info!("WebSocket connected, status: {}", response.status());
                let _ = event_tx.send(TransportEvent::Connected);

                if let tungstenite::stream::MaybeTlsStream::Plain(tcp) = socket.get_mut() {
                    let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
                    let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
                }

                loop {
                    match cmd_rx.try_recv() {
                        Ok(WsCommand::Send(msg)) => {
                            if let Err(e) = socket.send(Message::Text(msg)) {
                                log::error!("WebSocket send error: {}", e);
                                let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                                break;
                            }
                        }
                        Ok(WsCommand::Close) => {
                            log::info!("WebSocket close requested");
                            let _ = socket.close(None);
                            break;
                        }
                        Err(TryRecvError::Disconnected) => break,
                        Err(TryRecvError::Empty) => {}
                    }

                    match socket.read() {
                        Ok(Message::Text(txt)) => {
                            let _ = event_tx.send(TransportEvent::Message(txt));
                        }
                        Ok(Message::Ping(data)) => {
                            let _ = socket.send(Message::Pong(data));
                        }
                        Ok(Message::Close(_)) => {
                            log::info!("WebSocket received close frame");
                            break;
                        }
                        Ok(_) => {}
                        Err(tungstenite::Error::Io(ref e))
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            log::error!("WebSocket read error: {}", e);
                            let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    }
                }

                log::info!("WebSocket thread exiting");
                let _ = event_tx.send(TransportEvent::Closed);
            });

            Ok(Self {
                cmd_tx: Some(cmd_tx),
                event_rx: Some(event_rx),
                _thread: Some(handle),
            })
        }
    }

    impl ChannelTransport for NativeWebSocket {
        fn send(&mut self, text: &str) -> Result<(), NetworkError> {
            match self.cmd_tx {
                Some(ref tx) => tx
                    .send(WsCommand::Send(text.to_string()))
                    .map_err(|e| NetworkError::Send(e.to_string())),
                None => Err(NetworkError::Closed),
            }
        }

        fn poll_events(&mut self) -> Vec<TransportEvent> {
            let mut events = Vec::new();
            if let Some(ref rx) = self.event_rx {
                while let Ok(event) = rx.try_recv() {
                    events.push(event);
                }
            }
            events
        }

        fn close(&mut self) {
            if let Some(tx) = self.cmd_tx.take() {
                let _ = tx.send(WsCommand::Close);
            }
            self.event_rx = None;
            self._thread = None;
        }
    }

    impl Drop for NativeWebSocket {
        fn drop(&mut self) {
            self.close();
        }
    }
}

pub use native_client::NativeWebSocket;

/// Connects to `{base_url}?token=...` with [`NativeWebSocket`].
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base_url: String,
}

impl WebSocketConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn url_for(&self, token: &str) -> Result<String, NetworkError> {
        let mut url =
            url::Url::parse(&self.base_url).map_err(|e| NetworkError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url.to_string())
    }
}

impl ChannelConnector for WebSocketConnector {
    fn connect(&self, token: &str) -> Result<Box<dyn ChannelTransport>, NetworkError> {
        let url = self.url_for(token)?;
        Ok(Box::new(NativeWebSocket::connect(&url)?))
    }
}

// ============================================================================
// In-process transport
// ============================================================================

#[derive(Debug, Default)]
struct Pipe {
    /// Frames sent by the client.
    sent: Vec<String>,
    /// Events waiting to be polled by the client.
    inbound: VecDeque<TransportEvent>,
    closed: bool,
}

/// In-process channel. The [`ChannelHandle`] plays the server side.
pub fn local_channel() -> (LocalTransport, ChannelHandle) {
    let pipe = Arc::new(Mutex::new(Pipe::default()));
    (
        LocalTransport { pipe: pipe.clone() },
        ChannelHandle { pipe },
    )
}

/// Client end of an in-process channel.
pub struct LocalTransport {
    pipe: Arc<Mutex<Pipe>>,
}

impl ChannelTransport for LocalTransport {
    fn send(&mut self, text: &str) -> Result<(), NetworkError> {
        let mut pipe = self.pipe.lock().map_err(|_| NetworkError::Closed)?;
        if pipe.closed {
            return Err(NetworkError::Closed);
        }
        pipe.sent.push(text.to_string());
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        match self.pipe.lock() {
            Ok(mut pipe) => pipe.inbound.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn close(&mut self) {
        if let Ok(mut pipe) = self.pipe.lock() {
            pipe.closed = true;
        }
    }
}

/// Server end of an in-process channel.
#[derive(Clone)]
pub struct ChannelHandle {
    pipe: Arc<Mutex<Pipe>>,
}

impl ChannelHandle {
    /// Queue an event for the client.
    pub fn push(&self, event: TransportEvent) {
        if let Ok(mut pipe) = self.pipe.lock() {
            pipe.inbound.push_back(event);
        }
    }

    /// Queue a text frame for the client.
    pub fn deliver(&self, text: impl Into<String>) {
        self.push(TransportEvent::Message(text.into()));
    }

    /// Take the frames the client sent so far.
    pub fn take_sent(&self) -> Vec<String> {
        match self.pipe.lock() {
            Ok(mut pipe) => std::mem::take(&mut pipe.sent),
            Err(_) => Vec::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pipe.lock().map(|p| p.closed).unwrap_or(true)
    }
}

/// Hands out prepared in-process transports, or fails while none are queued.
#[derive(Clone, Default)]
pub struct ChannelConnectorStub {
    ready: Arc<Mutex<VecDeque<LocalTransport>>>,
}

impl ChannelConnectorStub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare the next connection and return its server end.
    pub fn prepare(&self) -> ChannelHandle {
        let (transport, handle) = local_channel();
        if let Ok(mut ready) = self.ready.lock() {
            ready.push_back(transport);
        }
        handle
    }
}

impl ChannelConnector for ChannelConnectorStub {
    fn connect(&self, _token: &str) -> Result<Box<dyn ChannelTransport>, NetworkError> {
        let next = self
            .ready
            .lock()
            .map_err(|_| NetworkError::Closed)?
            .pop_front();
        match next {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(NetworkError::Connect("no channel available".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_rejects_bad_scheme() {
        assert!(matches!(
            NativeWebSocket::connect("http://localhost:1"),
            Err(NetworkError::InvalidUrl(_))
        ));
        assert!(matches!(
            NativeWebSocket::connect("not a url"),
            Err(NetworkError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_connector_appends_token() {
        let connector = WebSocketConnector::new("ws://localhost:3030/ws");
        assert_eq!(
            connector.url_for("a b").unwrap(),
            "ws://localhost:3030/ws?token=a+b"
        );
    }

    #[test]
    fn test_local_pair() {
        let (mut transport, handle) = local_channel();
        handle.push(TransportEvent::Connected);
        handle.deliver("hello");
        transport.send("out").unwrap();
        assert_eq!(
            transport.poll_events(),
            vec![TransportEvent::Connected, TransportEvent::Message("hello".into())]
        );
        assert!(transport.poll_events().is_empty());
        assert_eq!(handle.take_sent(), vec!["out".to_string()]);
        transport.close();
        assert!(handle.is_closed());
        assert_eq!(transport.send("late"), Err(NetworkError::Closed));
    }

    #[test]
    fn test_stub_connector_queue() {
        let connector = ChannelConnectorStub::new();
        assert!(connector.connect("t").is_err());
        let _server = connector.prepare();
        assert!(connector.connect("t").is_ok());
        assert!(connector.connect("t").is_err());
    }
}
