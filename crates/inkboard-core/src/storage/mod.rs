//! Drawing persistence.
//!
//! A [`Drawing`] is the saved form of a canvas: strokes, image records and
//! options. Uploaded images are stored by blob-store URL and rehydrated through
//! a [`BlobStore`] on restore; [`Drawing::capture_embedded`] inlines the
//! bytes of images that were never uploaded.

mod autosave;
mod file;
mod memory;

pub use autosave::{AutoSaveManager, DEFAULT_AUTOSAVE_INTERVAL_SECS, LAST_DRAWING_KEY};
pub use file::FilePersistence;
pub use memory::MemoryPersistence;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::BoxFuture;
use crate::canvas::{Canvas, CanvasSettings, CanvasState};
use crate::collab::services::BlobStore;
use crate::error::{CanvasError, InkboardResult};
use crate::image::{Bitmap, ImageId, ImageRecord};
use crate::strokes::Stroke;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Drawing not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Storage error: {0}")]
    Other(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Saved drawing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Drawing {
    pub title: String,
    #[serde(default)]
    pub strokes: Vec<Stroke>,
    #[serde(default)]
    pub images: Vec<ImageRecord>,
    #[serde(default)]
    pub options: CanvasSettings,
}

impl Drawing {
    /// Snapshot what is on the canvas. Images are recorded back to front.
    pub fn capture(state: &CanvasState, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            strokes: state.strokes().to_vec(),
            images: state.images().iter().map(|img| img.record()).collect(),
            options: state.settings().clone(),
        }
    }

    /// Like [`capture`](Self::capture), but images without a URL carry their
    /// encoded bytes so the drawing restores without a blob store.
    pub fn capture_embedded(state: &CanvasState, title: impl Into<String>) -> Result<Self, CanvasError> {
        let images = state
            .images()
            .iter()
            .map(|img| match img.url {
                Some(_) => Ok(img.record()),
                None => img.embedded_record(),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            images,
            ..Self::capture(state, title)
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Replace the canvas contents with this drawing, decoding inlined bitmaps
    /// and downloading the rest from `blobs`. History is reset.
    ///
    /// Returns the ids of images that could not be restored (no bytes and no
    /// URL, failed download or undecodable bytes); those are skipped with a
    /// warning.
    pub async fn restore(&self, canvas: &mut Canvas, blobs: &dyn BlobStore) -> InkboardResult<Vec<ImageId>> {
        canvas.clear();
        let state = canvas.state_mut();
        state.set_settings(self.options.clone());
        for stroke in &self.strokes {
            state.add_stroke(stroke.clone());
        }

        let mut missing = Vec::new();
        for record in &self.images {
            let bitmap = match (record.embedded_bitmap(), record.url.as_deref()) {
                (Some(bitmap), _) => bitmap,
                (None, Some(url)) => match blobs.download(url).await {
                    Ok(bytes) => Bitmap::decode(&bytes),
                    Err(e) => {
                        log::warn!("Failed to download {}: {}", url, e);
                        missing.push(record.id.clone());
                        continue;
                    }
                },
                (None, None) => {
                    log::warn!("Image {} has no stored bitmap", record.id);
                    missing.push(record.id.clone());
                    continue;
                }
            };
            match bitmap.and_then(|bitmap| record.clone().into_image(bitmap)) {
                Ok(image) => state.insert_image(image, None)?,
                Err(e) => {
                    log::warn!("Failed to restore image {}: {}", record.id, e);
                    missing.push(record.id.clone());
                }
            }
        }
        Ok(missing)
    }
}

/// Drawing storage backend.
pub trait Persistence: Send + Sync {
    /// Load a drawing.
    fn load_drawing(&self, id: &str) -> BoxFuture<'_, StorageResult<Drawing>>;

    /// Save a drawing under `id`, or under a fresh id when `None`. Returns the id used.
    fn save_drawing(&self, id: Option<&str>, drawing: &Drawing) -> BoxFuture<'_, StorageResult<String>>;

    fn delete_drawing(&self, id: &str) -> BoxFuture<'_, StorageResult<()>>;

    /// List all drawing ids.
    fn list_drawings(&self) -> BoxFuture<'_, StorageResult<Vec<String>>>;

    fn drawing_exists(&self, id: &str) -> BoxFuture<'_, StorageResult<bool>>;
}

fn resolve_id(id: Option<&str>) -> String {
    id.map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
