use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::{CaptureSettings, SourceDescriptor};
use crate::registry::validate_id;
use crate::session::RetryPolicy;

const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_SNAPSHOT_DIR: &str = "detected_persons";
/// YOLO when it is compiled in, otherwise the model-free stub for `stub://` demos.
#[cfg(feature = "backend-tract")]
pub const DEFAULT_BACKEND: &str = "tract";
#[cfg(not(feature = "backend-tract"))]
pub const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_MODEL_PATH: &str = "yolov8n.onnx";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE: f32 = 0.6;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_MONITORED_LABEL: &str = "person";
const DEFAULT_SOUND_PATH: &str = "alert.mp3";
const DEFAULT_PLAYER: [&str; 5] = ["ffplay", "-nodisp", "-autoexit", "-loglevel", "quiet"];
const DEFAULT_ALERT_COOLDOWN_SECS: u64 = 3;
const DEFAULT_SNAPSHOT_COOLDOWN_SECS: u64 = 5;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
struct CamwatchConfigFile {
    api: Option<ApiConfigFile>,
    snapshot_dir: Option<PathBuf>,
    detection: Option<DetectionConfigFile>,
    alert: Option<AlertConfigFile>,
    capture: Option<CaptureConfigFile>,
    overlay: Option<OverlayConfigFile>,
    retry: Option<RetryConfigFile>,
    shutdown_timeout_secs: Option<u64>,
    cameras: Option<Vec<CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence: Option<f32>,
    iou: Option<f32>,
    monitored_label: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    sound_path: Option<PathBuf>,
    player: Option<Vec<String>>,
    cooldown_secs: Option<u64>,
    snapshot_cooldown_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct OverlayConfigFile {
    font_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct RetryConfigFile {
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: String,
    url: CameraUrl,
}

/// `camera_url` is either a device index or a URI, in config files and the HTTP API alike.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CameraUrl {
    Index(u32),
    Text(String),
}

impl CameraUrl {
    pub fn to_descriptor(&self) -> SourceDescriptor {
        match self {
            CameraUrl::Index(index) => SourceDescriptor::Device(*index),
            CameraUrl::Text(text) => SourceDescriptor::parse(text),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CamwatchConfig {
    pub api_addr: String,
    pub snapshot_dir: PathBuf,
    pub detection: DetectionSettings,
    pub alert: AlertSettings,
    pub capture: CaptureSettings,
    pub jpeg_quality: u8,
    pub font_path: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub shutdown_timeout: Duration,
    pub cameras: Vec<StartupCamera>,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub backend: String,
    pub model_path: PathBuf,
    pub input_size: u32,
    pub confidence: f32,
    pub iou: f32,
    pub monitored_label: String,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub sound_path: PathBuf,
    pub player: Vec<String>,
    pub cooldown: Duration,
    pub snapshot_cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct StartupCamera {
    pub id: String,
    pub source: SourceDescriptor,
}

impl CamwatchConfig {
    /// Defaults, then the file named by `CAMWATCH_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CamwatchConfigFile) -> Self {
        let detection = file.detection.unwrap_or_default();
        let alert = file.alert.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let retry = file.retry.unwrap_or_default();
        let default_retry = RetryPolicy::default();
        let default_capture = CaptureSettings::default();

        Self {
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            snapshot_dir: file
                .snapshot_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR)),
            detection: DetectionSettings {
                backend: detection
                    .backend
                    .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
                model_path: detection
                    .model_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
                input_size: detection.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
                confidence: detection.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                iou: detection.iou.unwrap_or(DEFAULT_IOU),
                monitored_label: detection
                    .monitored_label
                    .unwrap_or_else(|| DEFAULT_MONITORED_LABEL.to_string()),
            },
            alert: AlertSettings {
                sound_path: alert
                    .sound_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SOUND_PATH)),
                player: alert
                    .player
                    .unwrap_or_else(|| DEFAULT_PLAYER.iter().map(|s| s.to_string()).collect()),
                cooldown: Duration::from_secs(
                    alert.cooldown_secs.unwrap_or(DEFAULT_ALERT_COOLDOWN_SECS),
                ),
                snapshot_cooldown: Duration::from_secs(
                    alert
                        .snapshot_cooldown_secs
                        .unwrap_or(DEFAULT_SNAPSHOT_COOLDOWN_SECS),
                ),
            },
            capture: CaptureSettings {
                width: capture.width.unwrap_or(default_capture.width),
                height: capture.height.unwrap_or(default_capture.height),
                target_fps: capture.target_fps.unwrap_or(default_capture.target_fps),
            },
            jpeg_quality: capture.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            font_path: file.overlay.and_then(|overlay| overlay.font_path),
            retry: RetryPolicy {
                initial_backoff: retry
                    .initial_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default_retry.initial_backoff),
                max_backoff: retry
                    .max_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default_retry.max_backoff),
                max_consecutive_failures: retry
                    .max_consecutive_failures
                    .unwrap_or(default_retry.max_consecutive_failures),
            },
            shutdown_timeout: Duration::from_secs(
                file.shutdown_timeout_secs
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            ),
            cameras: file
                .cameras
                .unwrap_or_default()
                .into_iter()
                .map(|camera| StartupCamera {
                    source: camera.url.to_descriptor(),
                    id: camera.id,
                })
                .collect(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("CAMWATCH_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(dir) = std::env::var("CAMWATCH_SNAPSHOT_DIR") {
            if !dir.trim().is_empty() {
                self.snapshot_dir = PathBuf::from(dir);
            }
        }
        if let Ok(backend) = std::env::var("CAMWATCH_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detection.backend = backend.trim().to_string();
            }
        }
        if let Ok(path) = std::env::var("CAMWATCH_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detection.model_path = PathBuf::from(path);
            }
        }
        if let Ok(confidence) = std::env::var("CAMWATCH_CONFIDENCE") {
            self.detection.confidence = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMWATCH_CONFIDENCE must be a number"))?;
        }
        if let Ok(path) = std::env::var("CAMWATCH_ALERT_SOUND") {
            if !path.trim().is_empty() {
                self.alert.sound_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("CAMWATCH_FONT_PATH") {
            if !path.trim().is_empty() {
                self.font_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(cameras) = std::env::var("CAMWATCH_CAMERAS") {
            let parsed = parse_camera_list(&cameras)?;
            if !parsed.is_empty() {
                self.cameras = parsed;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let confidence = self.detection.confidence;
        if !(confidence > 0.0 && confidence <= 1.0) {
            return Err(anyhow!("detection confidence must be in (0, 1], got {}", confidence));
        }
        if !(self.detection.iou > 0.0 && self.detection.iou <= 1.0) {
            return Err(anyhow!("detection iou must be in (0, 1]"));
        }
        if self.detection.input_size == 0 || self.detection.input_size % 32 != 0 {
            return Err(anyhow!("detection input_size must be a positive multiple of 32"));
        }
        if self.detection.monitored_label.trim().is_empty() {
            return Err(anyhow!("detection monitored_label must not be empty"));
        }
        if self.alert.cooldown.is_zero() || self.alert.snapshot_cooldown.is_zero() {
            return Err(anyhow!("alert cooldowns must be greater than zero"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("capture jpeg_quality must be in 1..=100"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture width and height must be non-zero"));
        }
        if self.retry.initial_backoff.is_zero() || self.retry.max_backoff < self.retry.initial_backoff {
            return Err(anyhow!("retry max_backoff must be >= initial_backoff > 0"));
        }
        if self.retry.max_consecutive_failures == 0 {
            return Err(anyhow!("retry max_consecutive_failures must be at least 1"));
        }
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            validate_id(&camera.id).map_err(|err| anyhow!("startup camera: {}", err))?;
            if !seen.insert(camera.id.as_str()) {
                return Err(anyhow!("startup camera '{}' listed twice", camera.id));
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<CamwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

/// `id=url,id=url`
fn parse_camera_list(value: &str) -> Result<Vec<StartupCamera>> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, url) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("CAMWATCH_CAMERAS entry '{}' must be id=url", entry))?;
            Ok(StartupCamera {
                id: id.trim().to_string(),
                source: SourceDescriptor::parse(url.trim()),
            })
        })
        .collect()
}
