//! Local capture devices via V4L2.
//!
//! A device index `N` maps to `/dev/videoN`. Format negotiation prefers packed RGB,
//! then YUYV, then MJPG, converting whatever the driver accepts to RGB.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{CaptureSettings, FrameSource, SourceDescriptor};
use crate::error::SourceError;
use crate::frame::Frame;

const ENODEV: i32 = 19;

pub struct V4l2Source {
    descriptor: SourceDescriptor,
    path: String,
    state: Option<DeviceState>,
    format: PixelFormat,
    width: u32,
    height: u32,
    frame_count: u64,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn open(index: u32, settings: &CaptureSettings) -> Result<Self, SourceError> {
        let path = format!("/dev/video{}", index);
        Self::connect(index, &path, settings)
            .map_err(|e| SourceError::Unavailable(format!("{}: {:#}", path, e)))
    }

    fn connect(index: u32, path: &str, settings: &CaptureSettings) -> Result<Self> {
        let device = v4l::Device::with_path(path).with_context(|| format!("open {}", path))?;
        let (format, width, height) = negotiate_format(&device, settings)?;

        if settings.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(settings.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Source: failed to set fps on {}: {}", path, err);
            }
        }

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Source: connected to {} ({}x{} {:?})",
            path,
            width,
            height,
            format
        );
        Ok(Self {
            descriptor: SourceDescriptor::Device(index),
            path: path.to_string(),
            state: Some(state),
            format,
            width,
            height,
            frame_count: 0,
        })
    }
}

fn negotiate_format(
    device: &v4l::Device,
    settings: &CaptureSettings,
) -> Result<(PixelFormat, u32, u32)> {
    let current = device.format().context("read v4l2 format")?;
    for preferred in [PixelFormat::Rgb24, PixelFormat::Yuyv, PixelFormat::Mjpeg] {
        let mut wanted = current.clone();
        wanted.width = settings.width;
        wanted.height = settings.height;
        wanted.fourcc = v4l::FourCC::new(&preferred.fourcc());
        match device.set_format(&wanted) {
            Ok(applied) if applied.fourcc == wanted.fourcc => {
                return Ok((preferred, applied.width, applied.height));
            }
            Ok(_) => continue,
            Err(err) => log::debug!("V4l2Source: format {:?} rejected: {}", preferred, err),
        }
    }
    PixelFormat::from_fourcc(&current.fourcc.repr)
        .map(|format| (format, current.width, current.height))
        .ok_or_else(|| anyhow!("device offers no supported pixel format ({})", current.fourcc))
}

impl FrameSource for V4l2Source {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let (format, width, height) = (self.format, self.width, self.height);
        let Some(state) = self.state.as_mut() else {
            return Err(SourceError::Ended(format!("{} is closed", self.path)));
        };
        let converted = state.with_mut(|fields| match fields.stream.next() {
            Ok((buf, meta)) => {
                let used = (meta.bytesused as usize).min(buf.len());
                let data = if used > 0 { &buf[..used] } else { buf };
                normalize_to_rgb(data, width, height, format)
                    .map_err(|e| SourceError::Transient(format!("{:#}", e)))
            }
            Err(err) if err.raw_os_error() == Some(ENODEV) => {
                Err(SourceError::Ended(format!("device removed: {}", err)))
            }
            Err(err) => Err(SourceError::Transient(format!("capture v4l2 frame: {}", err))),
        });
        let (pixels, w, h) = converted?;

        self.frame_count += 1;
        Frame::from_rgb(w, h, pixels, self.frame_count)
            .map_err(|e| SourceError::Transient(format!("{:#}", e)))
    }

    fn close(&mut self) {
        if self.state.take().is_some() {
            log::debug!("V4l2Source: {} released", self.path);
        }
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }
}
