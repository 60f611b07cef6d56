//! Inline preview generation for image entries
//!
//! Every image entry carries a small JPEG preview that travels inline with
//! the entry (history snapshots and bus events). The full-resolution bytes
//! stay in the payload store.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::kind::MediaType;

/// Default maximum preview width in pixels
pub const DEFAULT_PREVIEW_WIDTH: u32 = 200;

/// Default JPEG quality of previews
pub const DEFAULT_PREVIEW_QUALITY: u8 = 60;

/// Error produced while building a preview
#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("unrecognized image data")]
    UnknownFormat,

    #[error("declared {declared} but content is {detected:?}")]
    Mismatch {
        declared: MediaType,
        detected: image::ImageFormat,
    },

    #[error("decode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("resize failed: {0}")]
    Resize(#[from] fast_image_resize::ResizeError),

    #[error("image has zero width or height")]
    Empty,

    #[error("preview task failed: {0}")]
    Task(String),
}

/// Encoded preview bytes (JPEG), base64 when serialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview(Bytes);

impl Preview {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Base64 form, suitable for a `data:` URL
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }
}

impl Serialize for Preview {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Preview {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Preview::new)
            .map_err(serde::de::Error::custom)
    }
}

/// Produces bounded-size previews from uploaded image bytes
pub trait Previewer: Send + Sync + 'static {
    /// Build a preview, verifying that `bytes` really are of type `media`
    fn make_preview(&self, bytes: &[u8], media: MediaType) -> Result<Preview, PreviewError>;
}

/// Downscales to a fixed maximum width and re-encodes as JPEG
#[derive(Debug, Clone)]
pub struct ThumbnailPreviewer {
    max_width: u32,
    quality: u8,
}

impl ThumbnailPreviewer {
    pub fn new(max_width: u32, quality: u8) -> Self {
        Self {
            max_width: max_width.max(1),
            quality: quality.clamp(1, 100),
        }
    }

    /// Target dimensions, aspect ratio preserved, never upscaled
    fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
        if width <= self.max_width {
            return (width, height);
        }
        let ratio = self.max_width as f64 / width as f64;
        let scaled_height = ((height as f64 * ratio) as u32).max(1);
        (self.max_width, scaled_height)
    }
}

impl Default for ThumbnailPreviewer {
    fn default() -> Self {
        Self::new(DEFAULT_PREVIEW_WIDTH, DEFAULT_PREVIEW_QUALITY)
    }
}

impl Previewer for ThumbnailPreviewer {
    fn make_preview(&self, bytes: &[u8], media: MediaType) -> Result<Preview, PreviewError> {
        let detected = image::guess_format(bytes).map_err(|_| PreviewError::UnknownFormat)?;
        if detected != media.image_format() {
            return Err(PreviewError::Mismatch {
                declared: media,
                detected,
            });
        }

        let decoded = image::load_from_memory_with_format(bytes, detected)?;
        if decoded.width() == 0 || decoded.height() == 0 {
            return Err(PreviewError::Empty);
        }

        let src = image::DynamicImage::ImageRgb8(decoded.to_rgb8());
        let (dst_width, dst_height) = self.target_size(src.width(), src.height());

        let thumb = if (dst_width, dst_height) == (src.width(), src.height()) {
            src
        } else {
            let mut dst = image::DynamicImage::new(dst_width, dst_height, image::ColorType::Rgb8);
            let mut resizer = fast_image_resize::Resizer::new();
            resizer.resize(
                &src,
                &mut dst,
                Some(&fast_image_resize::ResizeOptions::new().resize_alg(
                    fast_image_resize::ResizeAlg::Convolution(
                        fast_image_resize::FilterType::Lanczos3,
                    ),
                )),
            )?;
            dst
        };

        let mut encoded = Vec::new();
        let encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut encoded, self.quality);
        thumb.write_with_encoder(encoder)?;

        Ok(Preview::new(encoded))
    }
}
