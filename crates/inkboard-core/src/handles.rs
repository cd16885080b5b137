//! Resize and rotate handles for a single selected image.

use kurbo::{Affine, Point, Size, Vec2};
use serde::{Deserialize, Serialize};

use crate::image::CanvasImage;
use crate::viewport::scale_of;

/// Which handle was grabbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleKind {
    Corner(Corner),
    Edge(Edge),
    /// Rotation handle above the top edge.
    Rotate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Edge {
    Top,
    Right,
    Bottom,
    Left,
}

impl HandleKind {
    /// The eight resize handles in drawing order.
    pub const RESIZE: [HandleKind; 8] = [
        HandleKind::Corner(Corner::TopLeft),
        HandleKind::Edge(Edge::Top),
        HandleKind::Corner(Corner::TopRight),
        HandleKind::Edge(Edge::Right),
        HandleKind::Corner(Corner::BottomRight),
        HandleKind::Edge(Edge::Bottom),
        HandleKind::Corner(Corner::BottomLeft),
        HandleKind::Edge(Edge::Left),
    ];

    /// Position in unit square coordinates of the bitmap. `None` for rotate.
    fn unit(self) -> Option<(f64, f64)> {
        Some(match self {
            HandleKind::Corner(Corner::TopLeft) => (0.0, 0.0),
            HandleKind::Corner(Corner::TopRight) => (1.0, 0.0),
            HandleKind::Corner(Corner::BottomLeft) => (0.0, 1.0),
            HandleKind::Corner(Corner::BottomRight) => (1.0, 1.0),
            HandleKind::Edge(Edge::Top) => (0.5, 0.0),
            HandleKind::Edge(Edge::Right) => (1.0, 0.5),
            HandleKind::Edge(Edge::Bottom) => (0.5, 1.0),
            HandleKind::Edge(Edge::Left) => (0.0, 0.5),
            HandleKind::Rotate => return None,
        })
    }

    pub fn is_corner(self) -> bool {
        matches!(self, HandleKind::Corner(_))
    }
}

/// A handle with its position in logical space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Handle {
    pub position: Point,
    pub kind: HandleKind,
}

impl Handle {
    pub fn new(position: Point, kind: HandleKind) -> Self {
        Self { position, kind }
    }

    pub fn hit_test(&self, point: Point, radius: f64) -> bool {
        (point - self.position).hypot2() <= radius * radius
    }
}

/// All nine handles of an image. They follow the image's rotation.
pub fn image_handles(image: &CanvasImage, rotate_offset: f64) -> Vec<Handle> {
    let size = image.bitmap().size();
    let t = image.transform();
    let mut handles: Vec<Handle> = HandleKind::RESIZE
        .iter()
        .filter_map(|kind| {
            let (u, v) = kind.unit()?;
            Some(Handle::new(t * Point::new(u * size.width, v * size.height), *kind))
        })
        .collect();
    handles.push(Handle::new(rotate_handle_position(image, rotate_offset), HandleKind::Rotate));
    handles
}

/// Where the rotate handle sits: `offset` logical units beyond the top edge midpoint.
pub fn rotate_handle_position(image: &CanvasImage, offset: f64) -> Point {
    let size = image.bitmap().size();
    let t = image.transform();
    let top = t * Point::new(size.width / 2.0, 0.0);
    let bottom = t * Point::new(size.width / 2.0, size.height);
    let up = top - bottom;
    let len = up.hypot();
    if len > 0.0 {
        top + up * (offset / len)
    } else {
        top
    }
}

/// Which handle (if any) is under `point`. The rotate handle wins ties.
pub fn hit_test_handles(
    image: &CanvasImage,
    point: Point,
    radius: f64,
    rotate_offset: f64,
) -> Option<HandleKind> {
    let handles = image_handles(image, rotate_offset);
    handles
        .iter()
        .rev()
        .find(|h| h.hit_test(point, radius))
        .map(|h| h.kind)
}

/// New transform for a resize gesture.
///
/// `delta` is the cumulative pointer movement since the gesture started, in
/// logical units. The handle opposite the grabbed one stays fixed. With
/// `keep_aspect_ratio` both axes scale by the same factor.
pub fn resize_transform(
    initial: Affine,
    bitmap_size: Size,
    handle: HandleKind,
    delta: Vec2,
    keep_aspect_ratio: bool,
    min_extent: f64,
) -> Affine {
    let Some((u, v)) = handle.unit() else {
        return initial;
    };
    if bitmap_size.width <= 0.0 || bitmap_size.height <= 0.0 {
        return initial;
    }

    let inverse = initial.inverse();
    let local_delta = (inverse * delta.to_point()) - (inverse * Point::ZERO);

    let scale = scale_of(initial);
    let min_sx = min_extent / (bitmap_size.width * scale.x.max(f64::EPSILON));
    let min_sy = min_extent / (bitmap_size.height * scale.y.max(f64::EPSILON));

    let axis_scale = |unit: f64, d: f64, extent: f64, min: f64| -> Option<f64> {
        if unit == 0.5 {
            return None;
        }
        let dir = if unit == 1.0 { 1.0 } else { -1.0 };
        Some(((extent + dir * d) / extent).max(min))
    };
    let sx = axis_scale(u, local_delta.x, bitmap_size.width, min_sx);
    let sy = axis_scale(v, local_delta.y, bitmap_size.height, min_sy);

    let (sx, sy) = if keep_aspect_ratio {
        let s = match (sx, sy) {
            (Some(x), Some(y)) => x.max(y),
            (Some(x), None) => x,
            (None, Some(y)) => y,
            (None, None) => 1.0,
        };
        (s, s)
    } else {
        (sx.unwrap_or(1.0), sy.unwrap_or(1.0))
    };

    let anchor = Vec2::new((1.0 - u) * bitmap_size.width, (1.0 - v) * bitmap_size.height);
    let local = Affine::translate(anchor) * Affine::scale_non_uniform(sx, sy) * Affine::translate(-anchor);
    initial * local
}
