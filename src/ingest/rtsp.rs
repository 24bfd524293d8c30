//! RTSP frame source backed by GStreamer.
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! appsink` negotiated to packed RGB.
//! The appsink keeps a single buffer and drops late ones, so a slow session never
//! accumulates decoder backlog.

use std::time::Duration;

use anyhow::{Context, Result};
use gstreamer::prelude::*;

use super::{frame_interval, redact_credentials, CaptureSettings, FrameSource, SourceDescriptor};
use crate::error::SourceError;
use crate::frame::Frame;

pub struct RtspSource {
    descriptor: SourceDescriptor,
    url: String,
    pipeline: Option<gstreamer::Pipeline>,
    appsink: gstreamer_app::AppSink,
    frame_timeout: Duration,
    frame_count: u64,
}

impl RtspSource {
    pub fn open(url: &str, settings: &CaptureSettings) -> Result<Self, SourceError> {
        Self::build(url, settings).map_err(|e| {
            SourceError::Unavailable(format!("{}: {:#}", redact_credentials(url), e))
        })
    }

    fn build(url: &str, settings: &CaptureSettings) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            url
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        log::info!("RtspSource: connected to {}", redact_credentials(url));

        let frame_timeout = (frame_interval(settings.target_fps) * 4).max(Duration::from_millis(500));
        Ok(Self {
            descriptor: SourceDescriptor::Uri(url.to_string()),
            url: url.to_string(),
            pipeline: Some(pipeline),
            appsink,
            frame_timeout,
            frame_count: 0,
        })
    }

    /// Drain pending bus messages; errors and EOS end the source.
    fn poll_bus(&self, pipeline: &gstreamer::Pipeline) -> Result<(), SourceError> {
        let Some(bus) = pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(SourceError::Ended(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    )));
                }
                MessageView::Eos(..) => {
                    return Err(SourceError::Ended("gstreamer reached EOS".to_string()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl FrameSource for RtspSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return Err(SourceError::Ended(format!(
                "{} is closed",
                redact_credentials(&self.url)
            )));
        };
        self.poll_bus(pipeline)?;

        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout.as_millis() as u64);
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| SourceError::Transient("RTSP stream stalled".to_string()))?;

        let (pixels, width, height) =
            sample_to_pixels(&sample).map_err(|e| SourceError::Transient(format!("{:#}", e)))?;
        self.frame_count += 1;
        Frame::from_rgb(width, height, pixels, self.frame_count)
            .map_err(|e| SourceError::Transient(format!("{:#}", e)))
    }

    fn close(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!(
                    "RtspSource: failed to stop pipeline for {}: {}",
                    redact_credentials(&self.url),
                    err
                );
            }
        }
    }

    fn is_open(&self) -> bool {
        self.pipeline.is_some()
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Copy a sample into tightly packed RGB rows.
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let packed = data.get(..len).context("RTSP buffer shorter than frame")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("RTSP buffer row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
