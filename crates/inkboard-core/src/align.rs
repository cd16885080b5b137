//! Align, distribute and flip for groups of images.
//!
//! Each operation produces a single [`Command`] so one undo reverses it.

use kurbo::{Affine, Rect, Vec2};
use serde::{Deserialize, Serialize};

use crate::canvas::CanvasState;
use crate::command::{Command, TransformKind};
use crate::error::CanvasError;
use crate::image::ImageId;
use crate::viewport::{flip_horizontal_about, flip_vertical_about};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alignment {
    Left,
    Right,
    Top,
    Bottom,
    CenterHorizontal,
    CenterVertical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distribution {
    Horizontal,
    Vertical,
}

fn bounds_of(state: &CanvasState, ids: &[ImageId]) -> Result<Vec<(ImageId, Rect)>, CanvasError> {
    ids.iter()
        .map(|id| {
            state
                .image(id)
                .map(|img| (id.clone(), img.bounds()))
                .ok_or_else(|| CanvasError::UnknownImage(id.clone()))
        })
        .collect()
}

fn translations(
    state: &CanvasState,
    kind: TransformKind,
    moves: Vec<(ImageId, Vec2)>,
) -> Result<Command, CanvasError> {
    Command::apply_delta(
        state,
        kind,
        moves
            .into_iter()
            .map(|(id, delta)| (id, Affine::translate(delta))),
    )
}

/// Line up the bounds of at least two images.
pub fn align(
    state: &CanvasState,
    ids: &[ImageId],
    alignment: Alignment,
) -> Result<Command, CanvasError> {
    if ids.len() < 2 {
        return Err(CanvasError::Empty("align needs at least two images"));
    }
    let items = bounds_of(state, ids)?;
    let union = items
        .iter()
        .map(|(_, r)| *r)
        .reduce(|a, b| a.union(b))
        .unwrap_or_default();
    let (left, right, top, bottom) = (union.x0, union.x1, union.y0, union.y1);

    let moves = items
        .iter()
        .map(|(id, r)| {
            let delta = match alignment {
                Alignment::Left => Vec2::new(left - r.x0, 0.0),
                Alignment::Right => Vec2::new(right - r.x1, 0.0),
                Alignment::Top => Vec2::new(0.0, top - r.y0),
                Alignment::Bottom => Vec2::new(0.0, bottom - r.y1),
                Alignment::CenterHorizontal => Vec2::new((left + right) / 2.0 - r.center().x, 0.0),
                Alignment::CenterVertical => Vec2::new(0.0, (top + bottom) / 2.0 - r.center().y),
            };
            (id.clone(), delta)
        })
        .collect();
    translations(state, TransformKind::Align, moves)
}

/// Space at least three images evenly between the outermost two.
pub fn distribute(
    state: &CanvasState,
    ids: &[ImageId],
    distribution: Distribution,
) -> Result<Command, CanvasError> {
    if ids.len() < 3 {
        return Err(CanvasError::Empty("distribute needs at least three images"));
    }
    let mut items = bounds_of(state, ids)?;
    let start = |r: &Rect| match distribution {
        Distribution::Horizontal => r.x0,
        Distribution::Vertical => r.y0,
    };
    let extent = |r: &Rect| match distribution {
        Distribution::Horizontal => r.width(),
        Distribution::Vertical => r.height(),
    };
    items.sort_by(|a, b| start(&a.1).total_cmp(&start(&b.1)));

    let first = start(&items[0].1);
    let last = &items[items.len() - 1].1;
    let span = start(last) + extent(last) - first;
    let total: f64 = items.iter().map(|(_, r)| extent(r)).sum();
    let gap = (span - total) / (items.len() - 1) as f64;

    let mut cursor = first;
    let mut moves = Vec::with_capacity(items.len());
    for (id, r) in &items {
        let shift = cursor - start(r);
        let delta = match distribution {
            Distribution::Horizontal => Vec2::new(shift, 0.0),
            Distribution::Vertical => Vec2::new(0.0, shift),
        };
        moves.push((id.clone(), delta));
        cursor += extent(r) + gap;
    }
    translations(state, TransformKind::Distribute, moves)
}

/// Mirror the images around the center of their combined bounds.
pub fn flip(state: &CanvasState, ids: &[ImageId], horizontal: bool) -> Result<Command, CanvasError> {
    let center = state
        .bounds_of(ids)
        .ok_or(CanvasError::Empty("nothing to flip"))?
        .center();
    let mirror = if horizontal {
        flip_horizontal_about(center)
    } else {
        flip_vertical_about(center)
    };
    Command::apply_delta(
        state,
        TransformKind::Flip,
        ids.iter().map(|id| (id.clone(), mirror)),
    )
}
