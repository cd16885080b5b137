//! Error taxonomy shared by the canvas, interaction and collaboration layers.

use std::sync::Mutex;
use thiserror::Error;

use crate::image::ImageId;

/// Connectivity or timeout failures talking to the channel, token service or blob store.
///
/// Always recoverable: the synchronizer turns these into reconnection attempts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Timed out after {0} ms")]
    Timeout(u64),
    #[error("Connection closed")]
    Closed,
    #[error("Send failed: {0}")]
    Send(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// The token collaborator refused to issue a token. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Token rejected: {0}")]
    Rejected(String),
    #[error("Token response malformed: {0}")]
    Malformed(String),
}

/// Invariant violations while executing a command or applying a transform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanvasError {
    #[error("Image not found: {0}")]
    UnknownImage(ImageId),
    #[error("Image already exists: {0}")]
    DuplicateImage(ImageId),
    #[error("Transform for {0} is not invertible")]
    SingularTransform(ImageId),
    #[error("Bitmap could not be decoded: {0}")]
    Decode(String),
    #[error("Nothing to apply: {0}")]
    Empty(&'static str),
}

/// Malformed or unexpected inbound payloads and session-level rejections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaborativeError {
    #[error("Malformed payload: {0}")]
    Malformed(String),
    #[error("Unexpected message: {0}")]
    Unexpected(String),
    #[error("Session rejected: {0}")]
    Rejected(String),
}

/// Failure to release a rendered resource. Logged only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("Failed to dispose picture for {0}: {1}")]
    Dispose(String, String),
}

/// Umbrella error for operations that cross categories.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InkboardError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Canvas(#[from] CanvasError),
    #[error(transparent)]
    Collaborative(#[from] CollaborativeError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl InkboardError {
    /// Whether the failure may succeed on a later attempt without user action.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, InkboardError::Auth(_))
    }
}

/// Result type for cross-category operations.
pub type InkboardResult<T> = Result<T, InkboardError>;

/// Error-reporting collaborator injected into the command stack and session.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &InkboardError);
}

/// Reports through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorReporter;

impl ErrorReporter for LogErrorReporter {
    fn report(&self, error: &InkboardError) {
        match error {
            InkboardError::Resource(e) => log::warn!("{}", e),
            InkboardError::Collaborative(e) => log::warn!("Dropped inbound event: {}", e),
            other => log::error!("{}", other),
        }
    }
}

/// Keeps every reported error. Useful for tests and diagnostics panes.
#[derive(Debug, Default)]
pub struct RecordingErrorReporter {
    errors: Mutex<Vec<InkboardError>>,
}

impl RecordingErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far.
    pub fn errors(&self) -> Vec<InkboardError> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ErrorReporter for RecordingErrorReporter {
    fn report(&self, error: &InkboardError) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(error.clone());
        }
    }
}
