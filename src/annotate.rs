//! Draws detections onto a frame before it is encoded for subscribers.
//!
//! Boxes are always drawn. Captions and the alert banner use the configured TrueType
//! font, or the bundled DejaVu Sans when none is configured. A configured font that
//! cannot be read degrades the overlay to boxes only.

use std::fs;
use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::detect::Detection;
use crate::error::AssetError;

/// Monitored-class boxes.
pub const MONITORED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
/// Every other class.
pub const OTHER_COLOR: Rgb<u8> = Rgb([255, 191, 0]);
pub const BANNER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

const BOX_THICKNESS: u32 = 2;
const CAPTION_SCALE: f32 = 16.0;
const BANNER_SCALE: f32 = 28.0;
const BANNER_ORIGIN: (i32, i32) = (20, 40);

static BUNDLED_FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");

pub struct Overlay {
    font: Option<FontVec>,
    monitored_label: String,
}

impl Overlay {
    /// Boxes only.
    pub fn boxes_only(monitored_label: impl Into<String>) -> Self {
        Self {
            font: None,
            monitored_label: monitored_label.into(),
        }
    }

    /// Captions and banner in the bundled font.
    pub fn bundled(monitored_label: impl Into<String>) -> Self {
        let monitored_label = monitored_label.into();
        match FontVec::try_from_vec(BUNDLED_FONT.to_vec()) {
            Ok(font) => Self {
                font: Some(font),
                monitored_label,
            },
            Err(err) => {
                log::warn!("bundled overlay font unusable, drawing boxes only: {}", err);
                Self::boxes_only(monitored_label)
            }
        }
    }

    /// Load the caption font from disk.
    pub fn with_font_file<P: AsRef<Path>>(
        monitored_label: impl Into<String>,
        path: P,
    ) -> Result<Self, AssetError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|err| AssetError::Missing {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let font = FontVec::try_from_vec(bytes).map_err(|err| AssetError::Missing {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            font: Some(font),
            monitored_label: monitored_label.into(),
        })
    }

    /// Configured font when loadable, bundled font when none is configured.
    /// An unreadable configured font leaves boxes only, with a warning.
    pub fn load(monitored_label: &str, font_path: Option<&Path>) -> Self {
        match font_path {
            None => Self::bundled(monitored_label),
            Some(path) => Self::with_font_file(monitored_label, path).unwrap_or_else(|err| {
                log::warn!("overlay text disabled: {}", err);
                Self::boxes_only(monitored_label)
            }),
        }
    }

    pub fn has_text(&self) -> bool {
        self.font.is_some()
    }

    pub fn monitored_label(&self) -> &str {
        &self.monitored_label
    }

    /// Draw every detection, plus the banner when `alerting` is set.
    pub fn draw(&self, image: &mut RgbImage, detections: &[Detection], camera_id: &str, alerting: bool) {
        for detection in detections {
            let color = if detection.is(&self.monitored_label) {
                MONITORED_COLOR
            } else {
                OTHER_COLOR
            };
            let Some(rect) = pixel_rect(detection, image.width(), image.height()) else {
                continue;
            };
            draw_thick_rect(image, rect, color);
            if let Some(font) = &self.font {
                let caption = format!("{} {:.2}", detection.label, detection.confidence);
                let y = (rect.top() - CAPTION_SCALE as i32 - 2).max(0);
                draw_text_mut(image, color, rect.left(), y, PxScale::from(CAPTION_SCALE), font, &caption);
            }
        }

        if alerting {
            if let Some(font) = &self.font {
                let banner = format!("Person Detected! [{}]", camera_id);
                draw_text_mut(
                    image,
                    BANNER_COLOR,
                    BANNER_ORIGIN.0,
                    BANNER_ORIGIN.1,
                    PxScale::from(BANNER_SCALE),
                    font,
                    &banner,
                );
            }
        }
    }
}

fn pixel_rect(detection: &Detection, width: u32, height: u32) -> Option<Rect> {
    let bbox = detection.bbox.clamp_to(width, height)?;
    let x = bbox.x1.floor() as i32;
    let y = bbox.y1.floor() as i32;
    let w = (bbox.x2.ceil() as i32 - x).max(1) as u32;
    let h = (bbox.y2.ceil() as i32 - y).max(1) as u32;
    Some(Rect::at(x, y).of_size(w, h))
}

fn draw_thick_rect(image: &mut RgbImage, rect: Rect, color: Rgb<u8>) {
    for inset in 0..BOX_THICKNESS {
        let (w, h) = (rect.width(), rect.height());
        if w <= 2 * inset || h <= 2 * inset {
            // too small for another ring; fill what is left
            let left = Rect::at(rect.left() + inset as i32, rect.top() + inset as i32)
                .of_size((w - 2 * inset).max(1), (h - 2 * inset).max(1));
            draw_filled_rect_mut(image, left, color);
            return;
        }
        let ring = Rect::at(rect.left() + inset as i32, rect.top() + inset as i32)
            .of_size(w - 2 * inset, h - 2 * inset);
        draw_hollow_rect_mut(image, ring, color);
    }
}
