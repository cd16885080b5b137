//! Inkboard Core Library
//!
//! Canvas state, undo/redo, image interaction and real-time collaboration for
//! the Inkboard whiteboard. Rendering lives in `inkboard-render`; nothing here
//! depends on a windowing system or GPU.

use std::future::Future;
use std::pin::Pin;

pub mod align;
pub mod canvas;
pub mod collab;
pub mod command;
pub mod config;
pub mod error;
pub mod handles;
pub mod image;
pub mod input;
pub mod interaction;
pub mod shortcuts;
pub mod storage;
pub mod strokes;
pub mod viewport;

/// Boxed future returned by the async collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

pub use align::{Alignment, Distribution};
pub use canvas::{Canvas, CanvasChange, CanvasSettings, CanvasState, ChangeKind, ChangeOrigin, SubscriberId};
pub use command::{Command, CommandStack, TransformKind};
pub use config::{CacheConfig, CanvasConfig, InkboardConfig, SyncConfig};
pub use error::{
    AuthError, CanvasError, CollaborativeError, ErrorReporter, InkboardError, InkboardResult, LogErrorReporter,
    NetworkError, ResourceError,
};
pub use image::{Bitmap, CanvasImage, ImageFormat, ImageId, ImageRecord};
pub use input::{Key, Modifiers, PointerEvent};
pub use interaction::{InteractionController, InteractionState, Tool};
pub use shortcuts::{ShortcutAction, ShortcutRegistry};
pub use storage::{AutoSaveManager, Drawing, FilePersistence, MemoryPersistence, Persistence, StorageError};
pub use strokes::{SerializableColor, Stroke, StrokeBuilder, StrokeKind, StrokeTool};
pub use viewport::LogicalViewport;
