//! Device ↔ logical coordinate mapping and affine helpers.
//!
//! All stored geometry lives in a fixed logical canvas (1920×1080 by default).
//! Pointer positions arrive in device pixels and are scaled into logical space
//! before any hit-testing or interaction math runs.

use kurbo::{Affine, Point, Rect, Size, Vec2};
use serde::{Deserialize, Serialize};

use crate::config::{LOGICAL_HEIGHT, LOGICAL_WIDTH};

/// Maps between the device surface and the logical canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogicalViewport {
    /// Size of the drawing surface in device pixels.
    pub device_size: Size,
    /// Size of the logical canvas.
    pub logical_size: Size,
}

impl Default for LogicalViewport {
    fn default() -> Self {
        let logical = Size::new(LOGICAL_WIDTH, LOGICAL_HEIGHT);
        Self {
            device_size: logical,
            logical_size: logical,
        }
    }
}

impl LogicalViewport {
    pub fn new(device_size: Size, logical_size: Size) -> Self {
        Self {
            device_size,
            logical_size,
        }
    }

    /// Viewport for a device surface over the default logical canvas.
    pub fn for_device(device_size: Size) -> Self {
        Self {
            device_size,
            ..Self::default()
        }
    }

    /// Update the device size (window resize, DPI change).
    pub fn resize(&mut self, device_size: Size) {
        self.device_size = device_size;
    }

    /// Per-axis factors that take device units to logical units.
    pub fn scale_factors(&self) -> Vec2 {
        let sx = if self.device_size.width > 0.0 {
            self.logical_size.width / self.device_size.width
        } else {
            1.0
        };
        let sy = if self.device_size.height > 0.0 {
            self.logical_size.height / self.device_size.height
        } else {
            1.0
        };
        Vec2::new(sx, sy)
    }

    /// Transform from device to logical space.
    pub fn device_to_logical_transform(&self) -> Affine {
        let s = self.scale_factors();
        Affine::scale_non_uniform(s.x, s.y)
    }

    /// Transform from logical to device space (what the render path uses).
    pub fn logical_to_device_transform(&self) -> Affine {
        let s = self.scale_factors();
        Affine::scale_non_uniform(1.0 / s.x, 1.0 / s.y)
    }

    pub fn device_to_logical(&self, point: Point) -> Point {
        self.device_to_logical_transform() * point
    }

    pub fn logical_to_device(&self, point: Point) -> Point {
        self.logical_to_device_transform() * point
    }

    /// Scale a device-space delta into logical units.
    pub fn to_logical_delta(&self, delta: Vec2) -> Vec2 {
        let s = self.scale_factors();
        Vec2::new(delta.x * s.x, delta.y * s.y)
    }

    /// The logical canvas as a rectangle.
    pub fn logical_rect(&self) -> Rect {
        self.logical_size.to_rect()
    }
}

/// Translate by `delta`.
pub fn translate(delta: Vec2) -> Affine {
    Affine::translate(delta)
}

/// Rotate by `angle` radians around `pivot` (clockwise on a y-down canvas).
pub fn rotate_about(angle: f64, pivot: Point) -> Affine {
    Affine::translate(pivot.to_vec2()) * Affine::rotate(angle) * Affine::translate(-pivot.to_vec2())
}

/// Non-uniform scale around `pivot`.
pub fn scale_about(sx: f64, sy: f64, pivot: Point) -> Affine {
    Affine::translate(pivot.to_vec2())
        * Affine::scale_non_uniform(sx, sy)
        * Affine::translate(-pivot.to_vec2())
}

/// Mirror across the vertical line through `pivot`.
pub fn flip_horizontal_about(pivot: Point) -> Affine {
    scale_about(-1.0, 1.0, pivot)
}

/// Mirror across the horizontal line through `pivot`.
pub fn flip_vertical_about(pivot: Point) -> Affine {
    scale_about(1.0, -1.0, pivot)
}

/// Whether an affine can be inverted without blowing up.
pub fn is_invertible(affine: Affine) -> bool {
    let det = affine.determinant();
    det.is_finite() && det.abs() > 1e-12 && affine.as_coeffs().iter().all(|c| c.is_finite())
}

/// Rotation component of an affine, in radians.
pub fn rotation_of(affine: Affine) -> f64 {
    let [a, b, _, _, _, _] = affine.as_coeffs();
    b.atan2(a)
}

/// Per-axis scale magnitudes of an affine.
pub fn scale_of(affine: Affine) -> Vec2 {
    let [a, b, c, d, _, _] = affine.as_coeffs();
    Vec2::new(a.hypot(b), c.hypot(d))
}

/// Coefficient-wise comparison with tolerance.
pub fn affine_approx_eq(lhs: Affine, rhs: Affine, epsilon: f64) -> bool {
    lhs.as_coeffs()
        .iter()
        .zip(rhs.as_coeffs().iter())
        .all(|(a, b)| (a - b).abs() <= epsilon)
}

/// Expand a 2D affine into a column-major 4×4 matrix.
pub fn to_matrix4(affine: Affine) -> [f64; 16] {
    let [a, b, c, d, e, f] = affine.as_coeffs();
    [
        a, b, 0.0, 0.0, //
        c, d, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        e, f, 0.0, 1.0,
    ]
}

/// Collapse a column-major 4×4 matrix into its 2D affine part.
pub fn from_matrix4(m: &[f64; 16]) -> Affine {
    Affine::new([m[0], m[1], m[4], m[5], m[12], m[13]])
}

/// Stable fingerprint of an affine, insensitive to float noise below 1e-6.
pub fn transform_fingerprint(affine: Affine) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;

    let mut hash = OFFSET;
    for coeff in affine.as_coeffs() {
        let q = (coeff * 1e6).round() as i64;
        for byte in q.to_le_bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(PRIME);
        }
    }
    hash
}
