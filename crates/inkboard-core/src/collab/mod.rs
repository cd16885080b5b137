//! Real-time collaboration: wire protocol, transports, external services,
//! the synchronizer and the session that drives it.

pub mod backoff;
pub mod protocol;
pub mod queue;
pub mod rate_limit;
pub mod services;
pub mod session;
pub mod synchronizer;
pub mod transport;

pub use backoff::Backoff;
pub use protocol::{BroadcastEvent, ClientMessage, EventPayload, ImageDescriptor, Presence, ServerMessage};
pub use queue::{OfflineQueue, RecentIds};
pub use rate_limit::RateLimiter;
pub use services::{
    BlobStore, HttpBlobStore, HttpTokenProvider, MemoryBlobStore, TokenProvider, TokenRequest, blob_path,
};
pub use session::{CollabSession, Collaborators};
pub use synchronizer::{ConnectionState, Identity, SyncEvent, Synchronizer};
pub use transport::{
    ChannelConnector, ChannelConnectorStub, ChannelHandle, ChannelTransport, LocalTransport, NativeWebSocket,
    TransportEvent, WebSocketConnector, local_channel,
};
