//! Stroke model: one committed drawing action.

mod builder;

pub use builder::{StrokeBuilder, StrokeTool};

use kurbo::{Point, Rect};
use peniko::Color;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Identifier of a stroke, unique across participants.
pub type StrokeId = String;

/// Minimum stroke width.
pub const MIN_STROKE_SIZE: f64 = 0.1;
/// Minimum opacity so a stroke never becomes invisible.
pub const MIN_STROKE_OPACITY: f64 = 0.1;
/// Minimum polygon side count.
pub const MIN_POLYGON_SIDES: u32 = 3;

/// RGBA8 color that serializes as `#rrggbbaa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SerializableColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl SerializableColor {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn black() -> Self {
        Self::new(0, 0, 0, 255)
    }

    pub const fn white() -> Self {
        Self::new(255, 255, 255, 255)
    }

    pub const fn transparent() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// Parse `#rgb`, `#rrggbb` or `#rrggbbaa`.
    pub fn from_hex(color: &str) -> Option<Self> {
        let hex = color.trim().strip_prefix('#')?;
        let channel = |s: &str| u8::from_str_radix(s, 16).ok();
        match hex.len() {
            3 => Some(Self::new(
                channel(&hex[0..1])? * 17,
                channel(&hex[1..2])? * 17,
                channel(&hex[2..3])? * 17,
                255,
            )),
            6 => Some(Self::new(
                channel(&hex[0..2])?,
                channel(&hex[2..4])?,
                channel(&hex[4..6])?,
                255,
            )),
            8 => Some(Self::new(
                channel(&hex[0..2])?,
                channel(&hex[2..4])?,
                channel(&hex[4..6])?,
                channel(&hex[6..8])?,
            )),
            _ => None,
        }
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
    }
}

impl Default for SerializableColor {
    fn default() -> Self {
        Self::black()
    }
}

impl From<Color> for SerializableColor {
    fn from(color: Color) -> Self {
        let rgba = color.to_rgba8();
        Self::new(rgba.r, rgba.g, rgba.b, rgba.a)
    }
}

impl From<SerializableColor> for Color {
    fn from(color: SerializableColor) -> Self {
        Color::from_rgba8(color.r, color.g, color.b, color.a)
    }
}

impl Serialize for SerializableColor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SerializableColor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid color: {s}")))
    }
}

/// Variant-specific part of a stroke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StrokeKind {
    Normal,
    Eraser,
    Line,
    Rectangle {
        #[serde(default)]
        filled: bool,
    },
    Square {
        #[serde(default)]
        filled: bool,
    },
    Circle {
        #[serde(default)]
        filled: bool,
    },
    Polygon {
        #[serde(deserialize_with = "de_sides")]
        sides: u32,
        #[serde(default)]
        filled: bool,
    },
    Text {
        text: String,
        #[serde(rename = "fontSize")]
        font_size: f64,
        #[serde(rename = "fontFamily", default = "default_font_family")]
        font_family: String,
    },
}

impl StrokeKind {
    /// Polygon with at least three sides.
    pub fn polygon(sides: u32, filled: bool) -> Self {
        StrokeKind::Polygon {
            sides: sides.max(MIN_POLYGON_SIDES),
            filled,
        }
    }

    /// Shape variants are defined by an anchor and an opposite point.
    pub fn is_shape(&self) -> bool {
        matches!(
            self,
            StrokeKind::Line
                | StrokeKind::Rectangle { .. }
                | StrokeKind::Square { .. }
                | StrokeKind::Circle { .. }
                | StrokeKind::Polygon { .. }
        )
    }

    /// Whether the shape is drawn filled.
    pub fn is_filled(&self) -> bool {
        match self {
            StrokeKind::Rectangle { filled }
            | StrokeKind::Square { filled }
            | StrokeKind::Circle { filled }
            | StrokeKind::Polygon { filled, .. } => *filled,
            _ => false,
        }
    }

    /// Wire name of the variant.
    pub fn name(&self) -> &'static str {
        match self {
            StrokeKind::Normal => "normal",
            StrokeKind::Eraser => "eraser",
            StrokeKind::Line => "line",
            StrokeKind::Rectangle { .. } => "rectangle",
            StrokeKind::Square { .. } => "square",
            StrokeKind::Circle { .. } => "circle",
            StrokeKind::Polygon { .. } => "polygon",
            StrokeKind::Text { .. } => "text",
        }
    }
}

fn default_font_family() -> String {
    "sans-serif".to_string()
}

fn de_sides<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    Ok(u32::deserialize(deserializer)?.max(MIN_POLYGON_SIDES))
}

fn de_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(clamp_size(f64::deserialize(deserializer)?))
}

fn de_opacity<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(clamp_opacity(f64::deserialize(deserializer)?))
}

fn clamp_size(size: f64) -> f64 {
    if size.is_finite() {
        size.max(MIN_STROKE_SIZE)
    } else {
        MIN_STROKE_SIZE
    }
}

fn clamp_opacity(opacity: f64) -> f64 {
    if opacity.is_finite() {
        opacity.clamp(MIN_STROKE_OPACITY, 1.0)
    } else {
        1.0
    }
}

fn default_opacity() -> f64 {
    1.0
}

fn new_stroke_id() -> StrokeId {
    Uuid::new_v4().to_string()
}

/// A drawn mark. Immutable once committed to the canvas; edits replace the whole value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    #[serde(default = "new_stroke_id")]
    pub id: StrokeId,
    #[serde(flatten)]
    pub kind: StrokeKind,
    /// Points in logical canvas space.
    pub points: Vec<Point>,
    pub color: SerializableColor,
    #[serde(deserialize_with = "de_size")]
    size: f64,
    #[serde(deserialize_with = "de_opacity", default = "default_opacity")]
    opacity: f64,
    /// User id of whoever drew it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl Stroke {
    /// Create an empty stroke with a fresh id.
    pub fn new(kind: StrokeKind, color: SerializableColor, size: f64, opacity: f64) -> Self {
        Self {
            id: new_stroke_id(),
            kind,
            points: Vec::new(),
            color,
            size: clamp_size(size),
            opacity: clamp_opacity(opacity),
            author: None,
        }
    }

    pub fn with_points(mut self, points: Vec<Point>) -> Self {
        self.points = points;
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<StrokeId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn size(&self) -> f64 {
        self.size
    }

    pub fn opacity(&self) -> f64 {
        self.opacity
    }

    /// Copy with a different width; the original is left untouched.
    pub fn with_size(mut self, size: f64) -> Self {
        self.size = clamp_size(size);
        self
    }

    pub fn with_opacity(mut self, opacity: f64) -> Self {
        self.opacity = clamp_opacity(opacity);
        self
    }

    pub fn is_eraser(&self) -> bool {
        matches!(self.kind, StrokeKind::Eraser)
    }

    /// Bounding box of the points, padded by half the width.
    pub fn bounds(&self) -> Rect {
        let mut iter = self.points.iter();
        let Some(first) = iter.next() else {
            return Rect::ZERO;
        };
        let rect = iter.fold(Rect::from_points(*first, *first), |r, p| {
            r.union_pt(*p)
        });
        let pad = match &self.kind {
            StrokeKind::Text { font_size, .. } => font_size.max(self.size),
            _ => self.size / 2.0,
        };
        rect.inflate(pad, pad)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
