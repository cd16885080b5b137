//! The "current stroke" while a drawing gesture is in progress.

use kurbo::Point;
use serde::{Deserialize, Serialize};

use super::{SerializableColor, Stroke, StrokeKind};

/// Brush settings a new stroke is created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokeTool {
    pub kind: StrokeKind,
    pub color: SerializableColor,
    pub size: f64,
    pub opacity: f64,
}

impl Default for StrokeTool {
    fn default() -> Self {
        Self {
            kind: StrokeKind::Normal,
            color: SerializableColor::black(),
            size: 2.0,
            opacity: 1.0,
        }
    }
}

impl StrokeTool {
    pub fn new(kind: StrokeKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn with_color(mut self, color: SerializableColor) -> Self {
        self.color = color;
        self
    }

    pub fn with_size(mut self, size: f64) -> Self {
        self.size = size;
        self
    }
}

/// Builds one stroke from pointer-down to pointer-up.
#[derive(Debug, Default)]
pub struct StrokeBuilder {
    current: Option<Stroke>,
    anchor: Option<Point>,
}

impl StrokeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a stroke at `point`, discarding any unfinished one.
    pub fn begin(&mut self, tool: &StrokeTool, point: Point, author: &str) {
        let stroke = Stroke::new(tool.kind.clone(), tool.color, tool.size, tool.opacity)
            .with_author(author)
            .with_points(vec![point]);
        self.anchor = Some(point);
        self.current = Some(stroke);
    }

    /// Feed a pointer-move.
    ///
    /// Freehand and eraser strokes append; shape strokes keep the anchor and track
    /// the opposite point; text stays pinned to where it started.
    pub fn extend(&mut self, point: Point) {
        let (Some(stroke), Some(anchor)) = (self.current.as_mut(), self.anchor) else {
            return;
        };
        match &stroke.kind {
            StrokeKind::Normal | StrokeKind::Eraser => {
                if stroke.points.last() != Some(&point) {
                    stroke.points.push(point);
                }
            }
            StrokeKind::Square { .. } => {
                stroke.points = vec![anchor, square_corner(anchor, point)];
            }
            kind if kind.is_shape() => {
                stroke.points = vec![anchor, point];
            }
            _ => {}
        }
    }

    /// Finish the gesture. Degenerate strokes (zero-size shapes, empty text) yield `None`.
    pub fn finish(&mut self) -> Option<Stroke> {
        self.anchor = None;
        let stroke = self.current.take()?;
        let keep = match &stroke.kind {
            StrokeKind::Text { text, .. } => !text.trim().is_empty(),
            kind if kind.is_shape() => {
                stroke.points.len() == 2 && stroke.points[0] != stroke.points[1]
            }
            _ => !stroke.points.is_empty(),
        };
        keep.then_some(stroke)
    }

    /// Drop the unfinished stroke.
    pub fn cancel(&mut self) {
        self.current = None;
        self.anchor = None;
    }

    pub fn current(&self) -> Option<&Stroke> {
        self.current.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }
}

/// Constrain the opposite corner so both sides are equal to the longer one.
fn square_corner(anchor: Point, point: Point) -> Point {
    let dx = point.x - anchor.x;
    let dy = point.y - anchor.y;
    let side = dx.abs().max(dy.abs());
    Point::new(anchor.x + side.copysign(dx), anchor.y + side.copysign(dy))
}
