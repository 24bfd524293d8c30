//! HTTP camera source.
//!
//! Handles the two shapes cheap network cameras expose:
//! - `multipart/x-mixed-replace` MJPEG streams, read continuously
//! - single-JPEG snapshot endpoints, polled once per frame
//!
//! Connection failures at open are `Unavailable`. Once streaming, a single
//! undecodable or late frame is `Transient`; the server closing the stream is `Ended`.

use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

use super::{frame_interval, redact_credentials, CaptureSettings, FrameSource, SourceDescriptor};
use crate::error::SourceError;
use crate::frame::{Frame, JPEG_EOI, JPEG_SOI};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MjpegSource {
    descriptor: SourceDescriptor,
    url: String,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    interval: Duration,
    last_frame_at: Option<Instant>,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl MjpegSource {
    pub fn open(url: &str, settings: &CaptureSettings) -> Result<Self, SourceError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        let response = agent.get(url).call().map_err(|e| {
            SourceError::Unavailable(format!(
                "connect to {}: {}",
                redact_credentials(url),
                e
            ))
        })?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        let stream = if content_type.contains("multipart") {
            HttpStream::Mjpeg(MjpegStream::new(response.into_reader()))
        } else {
            HttpStream::SingleJpeg
        };
        log::info!(
            "MjpegSource: connected to {} ({})",
            redact_credentials(url),
            if content_type.contains("multipart") {
                "mjpeg"
            } else {
                "snapshot polling"
            }
        );
        Ok(Self {
            descriptor: SourceDescriptor::Uri(url.to_string()),
            url: url.to_string(),
            agent,
            stream: Some(stream),
            interval: frame_interval(settings.target_fps),
            last_frame_at: None,
            frame_count: 0,
        })
    }

    fn fetch_single_jpeg(&self) -> Result<Vec<u8>, SourceError> {
        let response = self.agent.get(&self.url).call().map_err(|e| {
            SourceError::Transient(format!("fetch snapshot: {}", e))
        })?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .map_err(|e| SourceError::Transient(format!("read snapshot: {}", e)))?;
        if bytes.is_empty() {
            return Err(SourceError::Transient("empty jpeg snapshot".to_string()));
        }
        Ok(bytes)
    }
}

impl FrameSource for MjpegSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let jpeg = match self.stream.as_mut() {
            None => {
                return Err(SourceError::Ended(format!(
                    "{} is closed",
                    redact_credentials(&self.url)
                )))
            }
            Some(HttpStream::Mjpeg(stream)) => stream.read_next_jpeg()?,
            Some(HttpStream::SingleJpeg) => {
                if let Some(last) = self.last_frame_at {
                    let elapsed = last.elapsed();
                    if elapsed < self.interval {
                        std::thread::sleep(self.interval - elapsed);
                    }
                }
                self.fetch_single_jpeg()?
            }
        };
        self.last_frame_at = Some(Instant::now());

        let image = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)
            .map_err(|e| SourceError::Transient(format!("decode jpeg: {}", e)))?
            .into_rgb8();
        self.frame_count += 1;
        Ok(Frame::new(image, self.frame_count))
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            log::debug!("MjpegSource: {} closed", redact_credentials(&self.url));
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

/// Incremental JPEG extractor over a multipart byte stream.
struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>, SourceError> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = match self.reader.read(&mut chunk) {
                Ok(0) => return Err(SourceError::Ended("mjpeg stream ended".to_string())),
                Ok(read) => read,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Err(SourceError::Transient(format!("mjpeg read stalled: {}", e)))
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(SourceError::Ended(format!("mjpeg read failed: {}", e))),
            };
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

/// Locate the first complete SOI..EOI span.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == JPEG_SOI)?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == JPEG_EOI)?;
    Some((start, start + 2 + end + 2))
}
