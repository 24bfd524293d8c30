//! Synthetic frame source (`stub://`).
//!
//! Paints a dim gradient scene with sensor noise and, on scheduled frames, a bright
//! block standing in for a person. Query parameters script the stream:
//!
//! - `frames=N`: end the source after N frames
//! - `person_every=K`: paint the block on every K-th frame (default: frames 30..60
//!   of each 90-frame cycle)
//! - `fail_every=M`: every M-th read is a transient missed grab
//! - `fps=F`: override the configured pacing (0 = as fast as possible)

use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};
use rand::Rng;
use url::Url;

use super::{frame_interval, CaptureSettings, FrameSource, SourceDescriptor};
use crate::error::SourceError;
use crate::frame::Frame;

/// Luma of the painted block. Background stays well below this.
pub const PERSON_BLOCK_LUMA: u8 = 235;

const DEFAULT_CYCLE: u64 = 90;
const DEFAULT_PRESENT: std::ops::Range<u64> = 30..60;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct SyntheticPlan {
    frames: Option<u64>,
    person_every: Option<u64>,
    fail_every: Option<u64>,
    fps: Option<u32>,
}

pub struct SyntheticSource {
    descriptor: SourceDescriptor,
    name: String,
    width: u32,
    height: u32,
    interval: Duration,
    plan: SyntheticPlan,
    frame_count: u64,
    reads: u64,
    last_frame_at: Option<Instant>,
    open: bool,
}

impl SyntheticSource {
    pub fn open(uri: &str, settings: &CaptureSettings) -> Result<Self, SourceError> {
        let url = Url::parse(uri)
            .map_err(|e| SourceError::Unavailable(format!("invalid stub uri '{}': {}", uri, e)))?;
        let plan = parse_plan(&url)?;
        let name = url.host_str().unwrap_or("synthetic").to_string();
        if settings.width < 8 || settings.height < 8 {
            return Err(SourceError::Unavailable(format!(
                "synthetic frame size {}x{} is too small",
                settings.width, settings.height
            )));
        }
        let fps = plan.fps.unwrap_or(settings.target_fps);
        log::info!("SyntheticSource: connected to {}", uri);
        Ok(Self {
            descriptor: SourceDescriptor::Uri(uri.to_string()),
            name,
            width: settings.width,
            height: settings.height,
            interval: frame_interval(fps),
            plan,
            frame_count: 0,
            reads: 0,
            last_frame_at: None,
            open: true,
        })
    }

    /// Whether the given 1-based frame carries the bright block.
    fn person_present(&self, frame_number: u64) -> bool {
        match self.plan.person_every {
            Some(0) => false,
            Some(every) => frame_number % every == 0,
            None => DEFAULT_PRESENT.contains(&(frame_number % DEFAULT_CYCLE)),
        }
    }

    fn pace(&mut self) {
        if self.interval.is_zero() {
            return;
        }
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }

    fn render(&self, frame_number: u64) -> RgbImage {
        let (w, h) = (self.width, self.height);
        let mut rng = rand::thread_rng();
        let mut image = RgbImage::from_fn(w, h, |x, y| {
            let base = ((x * 96 / w) + (y * 24 / h)) as u8;
            let noise: u8 = rng.gen_range(0..16);
            Rgb([base + noise, base / 2 + noise, 40 + noise])
        });

        if self.person_present(frame_number) {
            let block_w = (w / 5).max(2);
            let block_h = (h / 2).max(2);
            let travel = (w - block_w).max(1) as u64;
            let x0 = ((frame_number * 4) % travel) as u32;
            let y0 = h / 4;
            for y in y0..(y0 + block_h).min(h) {
                for x in x0..(x0 + block_w).min(w) {
                    image.put_pixel(
                        x,
                        y,
                        Rgb([PERSON_BLOCK_LUMA, PERSON_BLOCK_LUMA, PERSON_BLOCK_LUMA]),
                    );
                }
            }
        }
        image
    }
}

impl FrameSource for SyntheticSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        if !self.open {
            return Err(SourceError::Ended(format!("{} is closed", self.name)));
        }
        self.reads += 1;
        if let Some(every) = self.plan.fail_every {
            if every > 0 && self.reads % every == 0 {
                return Err(SourceError::Transient(format!(
                    "{}: synthetic missed grab",
                    self.name
                )));
            }
        }
        if let Some(limit) = self.plan.frames {
            if self.frame_count >= limit {
                return Err(SourceError::Ended(format!(
                    "{}: stream exhausted after {} frames",
                    self.name, limit
                )));
            }
        }

        self.pace();
        self.frame_count += 1;
        Ok(Frame::new(self.render(self.frame_count), self.frame_count))
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            log::debug!("SyntheticSource: {} closed", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

fn parse_plan(url: &Url) -> Result<SyntheticPlan, SourceError> {
    let mut plan = SyntheticPlan::default();
    for (key, value) in url.query_pairs() {
        let parsed: u64 = value.parse().map_err(|_| {
            SourceError::Unavailable(format!("stub parameter {}='{}' is not an integer", key, value))
        })?;
        match key.as_ref() {
            "frames" => plan.frames = Some(parsed),
            "person_every" => plan.person_every = Some(parsed),
            "fail_every" => plan.fail_every = Some(parsed),
            "fps" => plan.fps = Some(parsed.min(u32::MAX as u64) as u32),
            other => {
                return Err(SourceError::Unavailable(format!(
                    "unknown stub parameter '{}'",
                    other
                )))
            }
        }
    }
    Ok(plan)
}
