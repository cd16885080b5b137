//! Canvas image entity: a transformed bitmap on the canvas.

use std::borrow::Cow;
use std::io::Cursor;
use std::sync::Arc;

use kurbo::{Affine, Point, Rect, Size};
use serde::{Deserialize, Serialize};

use crate::error::CanvasError;
use crate::viewport::{affine_approx_eq, from_matrix4, is_invertible, rotation_of, scale_of, to_matrix4};

/// Opaque, globally unique image identifier.
pub type ImageId = String;

/// Encoded image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    WebP,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::WebP => "image/webp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::WebP => "webp",
        }
    }

    /// Detect format from magic bytes.
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
            return Some(ImageFormat::Png);
        }
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(ImageFormat::Jpeg);
        }
        if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            return Some(ImageFormat::WebP);
        }
        None
    }
}

/// Decoded pixels plus the bytes they came from.
///
/// Pixel storage is shared and immutable, so cloning a bitmap is cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    format: Option<ImageFormat>,
    encoded: Arc<[u8]>,
    rgba: Arc<[u8]>,
}

impl Bitmap {
    /// Decode PNG, JPEG or WebP bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CanvasError> {
        let format = ImageFormat::from_magic_bytes(bytes)
            .ok_or_else(|| CanvasError::Decode("unrecognised image format".to_string()))?;
        let decoded =
            ::image::load_from_memory(bytes).map_err(|e| CanvasError::Decode(e.to_string()))?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(Self {
            width,
            height,
            format: Some(format),
            encoded: Arc::from(bytes),
            rgba: Arc::from(rgba.into_raw()),
        })
    }

    /// Wrap raw RGBA8 pixels. Fails if the buffer does not match the dimensions.
    pub fn from_rgba(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, CanvasError> {
        if width == 0 || height == 0 || rgba.len() != (width as usize) * (height as usize) * 4 {
            return Err(CanvasError::Decode(format!(
                "{} bytes do not describe a {}x{} RGBA image",
                rgba.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            format: None,
            encoded: Arc::from(Vec::new()),
            rgba: Arc::from(rgba),
        })
    }

    /// Solid-colour bitmap.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self, CanvasError> {
        let pixels = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self::from_rgba(width, height, pixels)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> Size {
        Size::new(self.width as f64, self.height as f64)
    }

    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    pub fn rgba(&self) -> &[u8] {
        &self.rgba
    }

    /// Bytes suitable for upload. Bitmaps built from raw pixels are encoded as PNG.
    pub fn encoded(&self) -> Result<(Cow<'_, [u8]>, ImageFormat), CanvasError> {
        if let Some(format) = self.format {
            return Ok((Cow::Borrowed(&self.encoded), format));
        }
        let buffer = ::image::RgbaImage::from_raw(self.width, self.height, self.rgba.to_vec())
            .ok_or_else(|| CanvasError::Decode("pixel buffer size mismatch".to_string()))?;
        let mut out = Cursor::new(Vec::new());
        buffer
            .write_to(&mut out, ::image::ImageFormat::Png)
            .map_err(|e| CanvasError::Decode(e.to_string()))?;
        Ok((Cow::Owned(out.into_inner()), ImageFormat::Png))
    }
}

/// A bitmap placed on the canvas.
///
/// `transform` maps bitmap pixel space (`0..width × 0..height`) into logical
/// canvas space and is always invertible.
#[derive(Debug, Clone, PartialEq)]
pub struct CanvasImage {
    id: ImageId,
    bitmap: Bitmap,
    transform: Affine,
    /// Blob-store URL once the bitmap has been uploaded.
    pub url: Option<String>,
}

impl CanvasImage {
    /// Create an unmodified image (identity transform).
    pub fn new(id: impl Into<ImageId>, bitmap: Bitmap) -> Self {
        Self {
            id: id.into(),
            bitmap,
            transform: Affine::IDENTITY,
            url: None,
        }
    }

    /// Builder form of [`CanvasImage::set_transform`] for freshly created images.
    pub fn with_transform(mut self, transform: Affine) -> Result<Self, CanvasError> {
        self.set_transform(transform)?;
        Ok(self)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn id(&self) -> &ImageId {
        &self.id
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn transform(&self) -> Affine {
        self.transform
    }

    /// Replace the transform. Rejects non-invertible matrices.
    pub fn set_transform(&mut self, transform: Affine) -> Result<(), CanvasError> {
        if !is_invertible(transform) {
            return Err(CanvasError::SingularTransform(self.id.clone()));
        }
        self.transform = transform;
        Ok(())
    }

    /// Same image under a new id (used by paste).
    pub fn duplicate(&self, id: impl Into<ImageId>) -> Self {
        Self {
            id: id.into(),
            bitmap: self.bitmap.clone(),
            transform: self.transform,
            url: self.url.clone(),
        }
    }

    /// Whether the transform differs from identity.
    pub fn is_modified(&self) -> bool {
        !affine_approx_eq(self.transform, Affine::IDENTITY, 1e-9)
    }

    /// The bitmap rectangle in its own pixel space.
    pub fn local_rect(&self) -> Rect {
        self.bitmap.size().to_rect()
    }

    /// Corners in logical space: top-left, top-right, bottom-right, bottom-left.
    pub fn corners(&self) -> [Point; 4] {
        let r = self.local_rect();
        [
            self.transform * Point::new(r.x0, r.y0),
            self.transform * Point::new(r.x1, r.y0),
            self.transform * Point::new(r.x1, r.y1),
            self.transform * Point::new(r.x0, r.y1),
        ]
    }

    /// Axis-aligned bounds in logical space.
    pub fn bounds(&self) -> Rect {
        self.transform.transform_rect_bbox(self.local_rect())
    }

    /// Center of the bounds.
    pub fn center(&self) -> Point {
        self.bounds().center()
    }

    /// Size of the bounds.
    pub fn size(&self) -> Size {
        self.bounds().size()
    }

    /// Rotation in radians.
    pub fn rotation(&self) -> f64 {
        rotation_of(self.transform)
    }

    /// Exact hit test against the transformed rectangle, grown by `tolerance` logical units.
    pub fn contains(&self, point: Point, tolerance: f64) -> bool {
        let local = self.transform.inverse() * point;
        let scale = scale_of(self.transform);
        let tx = if scale.x > 0.0 { tolerance / scale.x } else { 0.0 };
        let ty = if scale.y > 0.0 { tolerance / scale.y } else { 0.0 };
        let r = self.local_rect().inflate(tx, ty);
        local.x >= r.x0 && local.x <= r.x1 && local.y >= r.y0 && local.y <= r.y1
    }

    /// Persistence/wire record.
    pub fn record(&self) -> ImageRecord {
        let scale = scale_of(self.transform);
        ImageRecord {
            id: self.id.clone(),
            position: self.transform * Point::ZERO,
            size: Size::new(
                self.bitmap.width as f64 * scale.x,
                self.bitmap.height as f64 * scale.y,
            ),
            rotation: self.rotation(),
            transform_matrix: to_matrix4(self.transform),
            url: self.url.clone(),
            data_base64: None,
            source_width: self.bitmap.width,
            source_height: self.bitmap.height,
        }
    }

    /// Record with the encoded bitmap inlined, for saving images that were never uploaded.
    pub fn embedded_record(&self) -> Result<ImageRecord, CanvasError> {
        use base64::{Engine, engine::general_purpose::STANDARD};

        let (bytes, _) = self.bitmap.encoded()?;
        let mut record = self.record();
        record.data_base64 = Some(STANDARD.encode(&bytes));
        Ok(record)
    }
}

/// Serialized form of a canvas image.
///
/// `position`, `size` and `rotation` are informational; `transformMatrix`
/// (column-major 4×4) is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: ImageId,
    pub position: Point,
    pub size: Size,
    pub rotation: f64,
    pub transform_matrix: [f64; 16],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Inlined image bytes when there is no `url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_base64: Option<String>,
    #[serde(default)]
    pub source_width: u32,
    #[serde(default)]
    pub source_height: u32,
}

impl ImageRecord {
    pub fn transform(&self) -> Affine {
        from_matrix4(&self.transform_matrix)
    }

    /// Decode the inlined bitmap, if any.
    pub fn embedded_bitmap(&self) -> Option<Result<Bitmap, CanvasError>> {
        use base64::{Engine, engine::general_purpose::STANDARD};

        let data = self.data_base64.as_deref()?;
        Some(
            STANDARD
                .decode(data)
                .map_err(|e| CanvasError::Decode(e.to_string()))
                .and_then(|bytes| Bitmap::decode(&bytes)),
        )
    }

    /// Rebuild the entity once the bitmap has been fetched and decoded.
    pub fn into_image(self, bitmap: Bitmap) -> Result<CanvasImage, CanvasError> {
        let transform = self.transform();
        let mut image = CanvasImage::new(self.id, bitmap);
        image.url = self.url;
        image.set_transform(transform)?;
        Ok(image)
    }
}
