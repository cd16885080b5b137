//! Inkboard Render Library
//!
//! Drawing-surface abstraction for Inkboard. Backends implement
//! [`DrawingSurface`]; [`CanvasPainter`] turns canvas state into draw calls and
//! keeps rendered image pictures in a bounded [`PictureCache`].

mod painter;
mod picture_cache;
mod renderer;
pub mod stroke_path;

pub use painter::CanvasPainter;
pub use picture_cache::{CacheStats, PictureCache, PictureKey};
pub use renderer::{
    DrawCommand, DrawingSurface, Picture, RecordedPicture, RecordingSurface, RenderContext, RenderResult,
    RendererError,
};
pub use stroke_path::{paint_stroke, stroke_path};
