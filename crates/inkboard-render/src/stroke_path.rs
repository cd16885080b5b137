//! Stroke geometry.
//!
//! Freehand and eraser strokes are polylines through their points. Shape
//! strokes are built from the anchor (first point) and the opposite corner
//! (last point).

use std::f64::consts::{FRAC_PI_2, TAU};

use inkboard_core::strokes::{Stroke, StrokeKind};
use kurbo::{BezPath, Circle, Point, Rect, Shape};
use peniko::Color;

use crate::renderer::DrawingSurface;

/// Accuracy of the Bézier approximation of circles.
const PATH_TOLERANCE: f64 = 0.1;

fn corners(stroke: &Stroke) -> Option<(Point, Point)> {
    let first = *stroke.points.first()?;
    let last = *stroke.points.last()?;
    Some((first, last))
}

/// Regular polygon inscribed in the largest circle that fits `rect`, first vertex at the top.
fn polygon(rect: Rect, sides: u32) -> BezPath {
    let center = rect.center();
    let radius = rect.width().min(rect.height()) / 2.0;
    let mut path = BezPath::new();
    for i in 0..sides {
        let angle = -FRAC_PI_2 + TAU * i as f64 / sides as f64;
        let vertex = center + radius * kurbo::Vec2::from_angle(angle);
        if i == 0 {
            path.move_to(vertex);
        } else {
            path.line_to(vertex);
        }
    }
    path.close_path();
    path
}

/// Outline of a stroke in logical space. Text strokes have no path.
pub fn stroke_path(stroke: &Stroke) -> BezPath {
    let mut path = BezPath::new();
    match &stroke.kind {
        StrokeKind::Normal | StrokeKind::Eraser => {
            let mut points = stroke.points.iter();
            if let Some(first) = points.next() {
                path.move_to(*first);
                // A single tap still leaves a dot.
                if stroke.points.len() == 1 {
                    path.line_to(*first);
                }
                for point in points {
                    path.line_to(*point);
                }
            }
        }
        StrokeKind::Line => {
            if let Some((a, b)) = corners(stroke) {
                path.move_to(a);
                path.line_to(b);
            }
        }
        StrokeKind::Rectangle { .. } | StrokeKind::Square { .. } => {
            if let Some((a, b)) = corners(stroke) {
                path = Rect::from_points(a, b).to_path(PATH_TOLERANCE);
            }
        }
        StrokeKind::Circle { .. } => {
            if let Some((a, b)) = corners(stroke) {
                let rect = Rect::from_points(a, b);
                let radius = rect.width().min(rect.height()) / 2.0;
                path = Circle::new(rect.center(), radius).to_path(PATH_TOLERANCE);
            }
        }
        StrokeKind::Polygon { sides, .. } => {
            if let Some((a, b)) = corners(stroke) {
                path = polygon(Rect::from_points(a, b), *sides);
            }
        }
        StrokeKind::Text { .. } => {}
    }
    path
}

/// Draw one stroke. Erasers paint with `background`.
pub fn paint_stroke<S: DrawingSurface>(
    surface: &mut S,
    stroke: &Stroke,
    transform: kurbo::Affine,
    background: Color,
) {
    let base: Color = if stroke.is_eraser() {
        background
    } else {
        stroke.color.into()
    };
    let color = base.multiply_alpha(stroke.opacity() as f32);

    if let StrokeKind::Text {
        text,
        font_size,
        font_family,
    } = &stroke.kind
    {
        if let Some(origin) = stroke.points.first() {
            surface.draw_text(text, *origin, *font_size, font_family, transform, color);
        }
        return;
    }

    let path = stroke_path(stroke);
    if path.elements().is_empty() {
        return;
    }
    if stroke.kind.is_filled() {
        surface.fill_path(&path, transform, color);
    }
    surface.stroke_path(&path, transform, stroke.size(), color);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::{DrawCommand, RecordingSurface};
    use inkboard_core::strokes::SerializableColor;
    use kurbo::{Affine, PathEl};

    fn stroke(kind: StrokeKind, points: &[(f64, f64)]) -> Stroke {
        Stroke::new(kind, SerializableColor::black(), 4.0, 1.0)
            .with_points(points.iter().map(|(x, y)| Point::new(*x, *y)).collect())
    }

    #[test]
    fn test_freehand_is_polyline() {
        let path = stroke_path(&stroke(StrokeKind::Normal, &[(0.0, 0.0), (5.0, 5.0), (10.0, 0.0)]));
        assert_eq!(
            path.elements(),
            &[
                PathEl::MoveTo(Point::new(0.0, 0.0)),
                PathEl::LineTo(Point::new(5.0, 5.0)),
                PathEl::LineTo(Point::new(10.0, 0.0)),
            ]
        );
    }

    #[test]
    fn test_single_point_leaves_a_dot() {
        let path = stroke_path(&stroke(StrokeKind::Normal, &[(3.0, 3.0)]));
        assert_eq!(path.elements().len(), 2);
    }

    #[test]
    fn test_shapes_fit_corner_rect() {
        let rect = stroke_path(&stroke(StrokeKind::Rectangle { filled: false }, &[(10.0, 10.0), (0.0, 20.0)]));
        assert_eq!(rect.bounding_box(), Rect::new(0.0, 10.0, 10.0, 20.0));

        let circle = stroke_path(&stroke(StrokeKind::Circle { filled: false }, &[(0.0, 0.0), (20.0, 10.0)]));
        let bounds = circle.bounding_box();
        assert!((bounds.width() - 10.0).abs() < 0.2);
        assert!((bounds.height() - 10.0).abs() < 0.2);
        assert!(bounds.x0 > 4.5 && bounds.x1 < 15.5);

        let triangle = stroke_path(&stroke(StrokeKind::polygon(3, false), &[(0.0, 0.0), (20.0, 20.0)]));
        // move + 2 lines + close
        assert_eq!(triangle.elements().len(), 4);
        assert!(matches!(triangle.elements()[0], PathEl::MoveTo(p) if (p - Point::new(10.0, 0.0)).hypot() < 1e-9));
    }

    #[test]
    fn test_filled_shapes_fill_and_stroke() {
        let mut surface = RecordingSurface::new();
        let filled = stroke(StrokeKind::Square { filled: true }, &[(0.0, 0.0), (5.0, 5.0)]);
        paint_stroke(&mut surface, &filled, Affine::IDENTITY, Color::from_rgba8(255, 255, 255, 255));
        assert!(matches!(surface.commands[0], DrawCommand::Fill { .. }));
        assert!(matches!(surface.commands[1], DrawCommand::Stroke { width, .. } if width == 4.0));
    }

    #[test]
    fn test_eraser_paints_background() {
        let mut surface = RecordingSurface::new();
        let white = Color::from_rgba8(255, 255, 255, 255);
        paint_stroke(&mut surface, &stroke(StrokeKind::Eraser, &[(0.0, 0.0), (1.0, 1.0)]), Affine::IDENTITY, white);
        assert!(matches!(&surface.commands[0], DrawCommand::Stroke { color, .. } if *color == white));
    }

    #[test]
    fn test_text_is_drawn_at_anchor() {
        let mut surface = RecordingSurface::new();
        let text = stroke(
            StrokeKind::Text {
                text: "hi".into(),
                font_size: 18.0,
                font_family: "serif".into(),
            },
            &[(4.0, 8.0)],
        );
        paint_stroke(&mut surface, &text, Affine::IDENTITY, Color::from_rgba8(255, 255, 255, 255));
        assert_eq!(
            surface.commands,
            vec![DrawCommand::Text {
                text: "hi".into(),
                origin: Point::new(4.0, 8.0),
                font_size: 18.0,
            }]
        );
    }
}
