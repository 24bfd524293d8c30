use anyhow::Result;
use image::RgbImage;

use crate::detect::result::Detection;

/// Detector backend trait.
///
/// One instance is loaded at startup and shared by every camera session, so
/// `detect` takes `&self` and implementations must be `Sync`. Sessions call it
/// concurrently from their own threads.
///
/// Contract:
/// - the frame is read-only
/// - detections below `confidence_threshold` are dropped by the backend itself
/// - boxes are in frame pixel coordinates
pub trait DetectorBackend: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn detect(&self, frame: &RgbImage, confidence_threshold: f32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once before the first camera starts.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
