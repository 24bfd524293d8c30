//! Frames as they move through a camera session.
//!
//! - `Frame`: one decoded RGB capture. Owned by the session for a single iteration,
//!   mutated only by the annotation step.
//! - `AnnotatedFrame`: the JPEG-encoded result handed to subscribers. Immutable once
//!   built and shared behind an `Arc`, so fan-out never copies the buffer.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

/// JPEG start-of-image marker.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
/// Largest width or height a baseline JPEG header can carry.
pub const JPEG_MAX_DIMENSION: u32 = u16::MAX as u32;

/// A raw capture in packed RGB8.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    /// Per-source capture counter, starting at 1.
    pub sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self { image, sequence }
    }

    /// Wrap packed RGB bytes. Fails when the buffer length does not match the dimensions.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>, sequence: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("rgb buffer rejected for {}x{}", width, height))?;
        Ok(Self { image, sequence })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Encoded output of one session iteration.
#[derive(Debug)]
pub struct AnnotatedFrame {
    camera_id: String,
    sequence: u64,
    jpeg: Vec<u8>,
}

impl AnnotatedFrame {
    pub fn new(camera_id: impl Into<String>, sequence: u64, jpeg: Vec<u8>) -> Self {
        Self {
            camera_id: camera_id.into(),
            sequence,
            jpeg,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn jpeg(&self) -> &[u8] {
        &self.jpeg
    }
}

/// Encode an RGB image as baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 || width > JPEG_MAX_DIMENSION || height > JPEG_MAX_DIMENSION {
        return Err(anyhow!("{}x{} frame cannot be encoded as JPEG", width, height));
    }
    let mut out = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(image)
        .context("jpeg encode")?;
    Ok(out)
}
