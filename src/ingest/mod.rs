//! Frame ingestion sources.
//!
//! A camera is described by a `SourceDescriptor` (local device index or stream URI)
//! and opened into a boxed `FrameSource`:
//! - `stub://` synthetic scenes (demos and tests)
//! - `http(s)://` MJPEG or single-JPEG network cameras
//! - `rtsp(s)://` IP cameras (feature: rtsp-gstreamer)
//! - device indices, mapped to `/dev/videoN` (feature: ingest-v4l2)
//!
//! Every source distinguishes a transient missed grab (`SourceError::Transient`),
//! which the session retries, from a source that will not recover
//! (`SourceError::Ended`), which stops the session.

pub mod mjpeg;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::SourceError;
use crate::frame::Frame;

pub use mjpeg::MjpegSource;
#[cfg(feature = "rtsp-gstreamer")]
pub use rtsp::RtspSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Where a camera's frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// Local capture device index.
    Device(u32),
    /// Network stream or synthetic URI.
    Uri(String),
}

impl SourceDescriptor {
    /// Integers are device indices; anything else is a URI.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<u32>() {
            Ok(index) => SourceDescriptor::Device(index),
            Err(_) => SourceDescriptor::Uri(trimmed.to_string()),
        }
    }

    /// Lowercased URI scheme; `None` for devices and scheme-less text.
    pub fn scheme(&self) -> Option<String> {
        match self {
            SourceDescriptor::Device(_) => None,
            SourceDescriptor::Uri(uri) => uri
                .split_once("://")
                .map(|(scheme, _)| scheme.to_ascii_lowercase()),
        }
    }

    /// `stub://` scenes rendered in-process.
    pub fn is_synthetic(&self) -> bool {
        self.scheme().as_deref() == Some("stub")
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Device(index) => write!(f, "device:{}", index),
            SourceDescriptor::Uri(uri) => f.write_str(&redact_credentials(uri)),
        }
    }
}

/// Capture parameters applied to every source.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    /// Frames per second. Zero disables pacing for sources that pace themselves.
    pub target_fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            target_fps: 10,
        }
    }
}

/// A single capture device or stream.
pub trait FrameSource: Send {
    fn descriptor(&self) -> &SourceDescriptor;

    /// Block until the next frame is available.
    fn read_frame(&mut self) -> Result<Frame, SourceError>;

    /// Release the device. Safe to call more than once.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Open the source a descriptor names.
pub fn open_source(
    descriptor: &SourceDescriptor,
    settings: &CaptureSettings,
) -> Result<Box<dyn FrameSource>, SourceError> {
    match descriptor {
        SourceDescriptor::Device(index) => open_device(*index, settings),
        SourceDescriptor::Uri(uri) => {
            match descriptor.scheme().unwrap_or_default().as_str() {
                "stub" => Ok(Box::new(SyntheticSource::open(uri, settings)?)),
                "http" | "https" => Ok(Box::new(MjpegSource::open(uri, settings)?)),
                "rtsp" | "rtsps" => open_rtsp(uri, settings),
                _ => Err(SourceError::Unavailable(format!(
                    "unsupported source '{}'",
                    redact_credentials(uri)
                ))),
            }
        }
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(
    index: u32,
    settings: &CaptureSettings,
) -> Result<Box<dyn FrameSource>, SourceError> {
    Ok(Box::new(V4l2Source::open(index, settings)?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(
    index: u32,
    _settings: &CaptureSettings,
) -> Result<Box<dyn FrameSource>, SourceError> {
    Err(SourceError::Unavailable(format!(
        "local device {} needs a build with `--features ingest-v4l2`",
        index
    )))
}

#[cfg(feature = "rtsp-gstreamer")]
fn open_rtsp(uri: &str, settings: &CaptureSettings) -> Result<Box<dyn FrameSource>, SourceError> {
    Ok(Box::new(RtspSource::open(uri, settings)?))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn open_rtsp(uri: &str, _settings: &CaptureSettings) -> Result<Box<dyn FrameSource>, SourceError> {
    Err(SourceError::Unavailable(format!(
        "{} requires the rtsp-gstreamer feature",
        redact_credentials(uri)
    )))
}

/// Minimum spacing between frames for a target rate.
pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

/// Strip `user:pass@` from URIs before they reach logs or API responses.
pub(crate) fn redact_credentials(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***@{}", scheme, &rest[at + 1..]),
        None => uri.to_string(),
    }
}
