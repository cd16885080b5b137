//! Drawing-surface abstraction.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use inkboard_core::canvas::CanvasState;
use inkboard_core::error::ResourceError;
use inkboard_core::image::{CanvasImage, ImageId};
use inkboard_core::strokes::Stroke;
use inkboard_core::viewport::LogicalViewport;
use kurbo::{Affine, BezPath, Point, Rect};
use peniko::Color;
use thiserror::Error;

/// Renderer errors.
#[derive(Debug, Error)]
pub enum RendererError {
    #[error("Initialization failed: {0}")]
    InitFailed(String),
    #[error("Render failed: {0}")]
    RenderFailed(String),
    #[error("Surface error: {0}")]
    Surface(String),
}

/// Result type for renderer operations.
pub type RenderResult<T> = Result<T, RendererError>;

/// A rendered image held by the backend (texture, display list, ...).
///
/// Pictures are a scarce native resource. Whoever drops one from use must call
/// [`Picture::dispose`] exactly once.
pub trait Picture {
    fn dispose(&mut self) -> Result<(), ResourceError>;
}

/// Backend the painter draws onto. Geometry arrives in logical canvas space
/// together with the transform to device space.
pub trait DrawingSurface {
    type Picture: Picture;

    /// Start a frame.
    fn clear(&mut self, color: Color);

    fn fill_path(&mut self, path: &BezPath, transform: Affine, color: Color);

    fn stroke_path(&mut self, path: &BezPath, transform: Affine, width: f64, color: Color);

    fn draw_text(&mut self, text: &str, origin: Point, font_size: f64, family: &str, transform: Affine, color: Color);

    /// Render `image` (with its transform applied, highlighted when `selected`)
    /// into a reusable picture in logical space.
    fn record_picture(&mut self, image: &CanvasImage, selected: bool, highlight: Color) -> RenderResult<Self::Picture>;

    fn draw_picture(&mut self, picture: &Self::Picture, transform: Affine);
}

/// Context for a single render frame.
pub struct RenderContext<'a> {
    pub state: &'a CanvasState,
    pub viewport: LogicalViewport,
    /// Overrides the canvas settings background when set.
    pub background: Option<Color>,
    pub selection_color: Color,
    /// Marquee rectangle in logical coordinates.
    pub selection_rect: Option<Rect>,
    /// Stroke being drawn, not yet committed.
    pub preview_stroke: Option<&'a Stroke>,
    /// Offset of the rotate handle above the top edge.
    pub rotate_handle_offset: f64,
    pub grid_size: f64,
}

impl<'a> RenderContext<'a> {
    pub fn new(state: &'a CanvasState, viewport: LogicalViewport) -> Self {
        Self {
            state,
            viewport,
            background: None,
            selection_color: Color::from_rgba8(59, 130, 246, 255),
            selection_rect: None,
            preview_stroke: None,
            rotate_handle_offset: 30.0,
            grid_size: 20.0,
        }
    }

    pub fn with_background(mut self, color: Color) -> Self {
        self.background = Some(color);
        self
    }

    pub fn with_selection_color(mut self, color: Color) -> Self {
        self.selection_color = color;
        self
    }

    pub fn with_selection_rect(mut self, rect: Option<Rect>) -> Self {
        self.selection_rect = rect;
        self
    }

    pub fn with_preview_stroke(mut self, stroke: Option<&'a Stroke>) -> Self {
        self.preview_stroke = stroke;
        self
    }

    pub fn with_rotate_handle_offset(mut self, offset: f64) -> Self {
        self.rotate_handle_offset = offset;
        self
    }

    /// Background to clear with.
    pub fn background_color(&self) -> Color {
        self.background
            .unwrap_or_else(|| self.state.settings().background.into())
    }
}

// =============================================================================
// RECORDING SURFACE
// =============================================================================

/// What a [`RecordingSurface`] was asked to draw.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    Clear(Color),
    Fill {
        path: BezPath,
        transform: Affine,
        color: Color,
    },
    Stroke {
        path: BezPath,
        transform: Affine,
        width: f64,
        color: Color,
    },
    Text {
        text: String,
        origin: Point,
        font_size: f64,
    },
    Picture {
        image_id: ImageId,
        selected: bool,
        transform: Affine,
    },
}

/// Picture produced by [`RecordingSurface`]. Counts disposals so leaks and
/// double disposals are observable.
#[derive(Debug)]
pub struct RecordedPicture {
    pub image_id: ImageId,
    pub selected: bool,
    disposed: bool,
    disposals: Arc<AtomicUsize>,
}

impl Picture for RecordedPicture {
    fn dispose(&mut self) -> Result<(), ResourceError> {
        if self.disposed {
            return Err(ResourceError::Dispose(
                self.image_id.clone(),
                "already disposed".to_string(),
            ));
        }
        self.disposed = true;
        self.disposals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Headless surface that records draw commands. Used for tests and for
/// inspecting what a frame would draw.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    pub commands: Vec<DrawCommand>,
    recorded: usize,
    disposals: Arc<AtomicUsize>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pictures recorded so far.
    pub fn pictures_recorded(&self) -> usize {
        self.recorded
    }

    /// Number of pictures disposed so far.
    pub fn pictures_disposed(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    /// Pictures recorded and not yet disposed.
    pub fn live_pictures(&self) -> usize {
        self.recorded - self.pictures_disposed()
    }

    pub fn take_commands(&mut self) -> Vec<DrawCommand> {
        std::mem::take(&mut self.commands)
    }
}

impl DrawingSurface for RecordingSurface {
    type Picture = RecordedPicture;

    fn clear(&mut self, color: Color) {
        self.commands.clear();
        self.commands.push(DrawCommand::Clear(color));
    }

    fn fill_path(&mut self, path: &BezPath, transform: Affine, color: Color) {
        self.commands.push(DrawCommand::Fill {
            path: path.clone(),
            transform,
            color,
        });
    }

    fn stroke_path(&mut self, path: &BezPath, transform: Affine, width: f64, color: Color) {
        self.commands.push(DrawCommand::Stroke {
            path: path.clone(),
            transform,
            width,
            color,
        });
    }

    fn draw_text(&mut self, text: &str, origin: Point, font_size: f64, _family: &str, _transform: Affine, _color: Color) {
        self.commands.push(DrawCommand::Text {
            text: text.to_string(),
            origin,
            font_size,
        });
    }

    fn record_picture(&mut self, image: &CanvasImage, selected: bool, _highlight: Color) -> RenderResult<RecordedPicture> {
        self.recorded += 1;
        Ok(RecordedPicture {
            image_id: image.id().clone(),
            selected,
            disposed: false,
            disposals: self.disposals.clone(),
        })
    }

    fn draw_picture(&mut self, picture: &RecordedPicture, transform: Affine) {
        self.commands.push(DrawCommand::Picture {
            image_id: picture.image_id.clone(),
            selected: picture.selected,
            transform,
        });
    }
}
