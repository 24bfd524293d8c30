use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};

const BRIGHT_LUMA: u32 = 200;
const MIN_BRIGHT_PIXELS: usize = 16;

/// Model-free backend for synthetic feeds: the bright region of a frame is one person.
///
/// Pairs with `stub://` sources, which paint a bright block on scheduled frames.
pub struct StubBackend {
    label: String,
    confidence: f32,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            label: "person".to_string(),
            confidence: 0.9,
        }
    }

    /// Override the score reported for bright regions.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&self, frame: &RgbImage, confidence_threshold: f32) -> Result<Vec<Detection>> {
        if self.confidence < confidence_threshold {
            return Ok(Vec::new());
        }

        let mut bright = 0usize;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0u32, 0u32);
        for (x, y, pixel) in frame.enumerate_pixels() {
            let [r, g, b] = pixel.0;
            let luma = (299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000;
            if luma >= BRIGHT_LUMA {
                bright += 1;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }

        if bright < MIN_BRIGHT_PIXELS {
            return Ok(Vec::new());
        }
        let bbox = BoundingBox::new(
            min_x as f32,
            min_y as f32,
            (max_x + 1) as f32,
            (max_y + 1) as f32,
        );
        Ok(bbox
            .map(|bbox| vec![Detection::new(self.label.clone(), self.confidence, bbox)])
            .unwrap_or_default())
    }
}
