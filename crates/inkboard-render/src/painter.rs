//! Paints a canvas onto a [`DrawingSurface`], caching image pictures between frames.

use std::time::Instant;

use inkboard_core::canvas::{CanvasState, ChangeKind, SubscriberId};
use inkboard_core::config::CacheConfig;
use inkboard_core::handles::{HandleKind, image_handles};
use inkboard_core::image::CanvasImage;
use kurbo::{Affine, BezPath, Circle, Point, Rect, Shape};
use peniko::Color;

use crate::picture_cache::{PictureCache, PictureKey};
use crate::renderer::{DrawingSurface, Picture, RenderContext};
use crate::stroke_path::paint_stroke;

/// Half the side of a resize handle square, in logical units.
const HANDLE_HALF_SIZE: f64 = 4.0;

/// Keeps a picture cache coherent with a canvas and draws frames from it.
///
/// The painter subscribes to the canvas change log. Call
/// [`sync_changes`](Self::sync_changes) before each [`paint`](Self::paint) so
/// pictures of removed or transformed images are released.
pub struct CanvasPainter<P: Picture> {
    cache: PictureCache<P>,
    subscriber: SubscriberId,
}

impl<P: Picture> CanvasPainter<P> {
    pub fn new(config: &CacheConfig, state: &mut CanvasState) -> Self {
        Self {
            cache: PictureCache::new(config),
            subscriber: state.subscribe(),
        }
    }

    pub fn cache(&self) -> &PictureCache<P> {
        &self.cache
    }

    /// Invalidate cached pictures for everything that changed since the last call.
    pub fn sync_changes(&mut self, state: &mut CanvasState) {
        for change in state.drain_changes(self.subscriber) {
            match change.kind {
                ChangeKind::ImageRemoved(id) | ChangeKind::TransformChanged(id) => {
                    let removed = self.cache.remove_image(&id);
                    if removed > 0 {
                        log::trace!("Invalidated {} pictures of {}", removed, id);
                    }
                }
                ChangeKind::Cleared => self.cache.clear(),
                _ => {}
            }
        }
    }

    /// Draw one frame.
    pub fn paint<S>(&mut self, surface: &mut S, ctx: &RenderContext<'_>, now: Instant)
    where
        S: DrawingSurface<Picture = P>,
    {
        let state = ctx.state;
        let transform = ctx.viewport.logical_to_device_transform();
        let background = ctx.background_color();

        surface.clear(background);

        if state.settings().grid && ctx.grid_size > 0.0 {
            paint_grid(surface, ctx.viewport.logical_rect(), ctx.grid_size, transform);
        }

        for image in state.images() {
            let selected = state.is_selected(image.id());
            let key = PictureKey::for_image(image, selected);
            if let Some(picture) = self.cache.get_at(&key, now) {
                surface.draw_picture(picture, transform);
                continue;
            }
            match surface.record_picture(image, selected, ctx.selection_color) {
                Ok(picture) => {
                    surface.draw_picture(&picture, transform);
                    self.cache.put_at(key, picture, now);
                }
                // Drawn again next frame; nothing is cached.
                Err(e) => log::warn!("Failed to render image {}: {}", image.id(), e),
            }
        }

        for stroke in state.strokes() {
            paint_stroke(surface, stroke, transform, background);
        }
        if let Some(stroke) = ctx.preview_stroke {
            paint_stroke(surface, stroke, transform, background);
        }

        if let Some(rect) = ctx.selection_rect {
            paint_marquee(surface, rect, transform, ctx.selection_color);
        }
        if let Some(image) = state.single_selection() {
            paint_handles(surface, image, ctx, transform);
        }

        self.cache.maybe_sweep_at(now);
    }

    /// Stop listening to the canvas. The cache is released on drop.
    pub fn detach(self, state: &mut CanvasState) {
        state.unsubscribe(self.subscriber);
    }
}

fn paint_grid<S: DrawingSurface>(surface: &mut S, area: Rect, grid_size: f64, transform: Affine) {
    let color = Color::from_rgba8(200, 200, 200, 100);
    let mut path = BezPath::new();

    let mut x = (area.x0 / grid_size).floor() * grid_size;
    while x <= area.x1 {
        path.move_to(Point::new(x, area.y0));
        path.line_to(Point::new(x, area.y1));
        x += grid_size;
    }
    let mut y = (area.y0 / grid_size).floor() * grid_size;
    while y <= area.y1 {
        path.move_to(Point::new(area.x0, y));
        path.line_to(Point::new(area.x1, y));
        y += grid_size;
    }
    surface.stroke_path(&path, transform, 0.5, color);
}

fn paint_marquee<S: DrawingSurface>(surface: &mut S, rect: Rect, transform: Affine, color: Color) {
    let path = rect.to_path(0.1);
    surface.fill_path(&path, transform, color.with_alpha(0.1));
    surface.stroke_path(&path, transform, 1.0, color);
}

fn paint_handles<S: DrawingSurface>(
    surface: &mut S,
    image: &CanvasImage,
    ctx: &RenderContext<'_>,
    transform: Affine,
) {
    let color = ctx.selection_color;

    // Outline follows rotation.
    let corners = image.corners();
    let mut outline = BezPath::new();
    outline.move_to(corners[0]);
    for corner in &corners[1..] {
        outline.line_to(*corner);
    }
    outline.close_path();
    surface.stroke_path(&outline, transform, 1.0, color);

    for handle in image_handles(image, ctx.rotate_handle_offset) {
        let path = match handle.kind {
            HandleKind::Rotate => Circle::new(handle.position, HANDLE_HALF_SIZE + 1.0).to_path(0.1),
            _ => Rect::from_center_size(
                handle.position,
                (HANDLE_HALF_SIZE * 2.0, HANDLE_HALF_SIZE * 2.0),
            )
            .to_path(0.1),
        };
        surface.fill_path(&path, transform, Color::WHITE);
        surface.stroke_path(&path, transform, 1.0, color);
    }
}
