//! camwatch: multi-camera person detection, alerting and MJPEG streaming.
//!
//! Every camera runs its own session thread: pull a frame, detect, annotate,
//! rate-limit side effects (audible alert, snapshot), encode and hand the frame
//! to any number of stream subscribers. A registry keyed by camera id lets the
//! HTTP control plane add, remove and list cameras while sessions run.
//!
//! # Module Structure
//!
//! - `ingest`: frame sources (synthetic, MJPEG over HTTP, RTSP, V4L2)
//! - `detect`: detector backends and their shared registry
//! - `annotate`, `alert`, `publish`: per-frame stages of a session
//! - `session`, `registry`: lifecycle and concurrency
//! - `config`, `api`: daemon plumbing

use anyhow::{anyhow, Result};
use std::sync::Arc;

pub mod alert;
pub mod annotate;
pub mod api;
pub mod clock;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod publish;
pub mod registry;
pub mod session;

pub use alert::{AlertDecision, AlertPolicy, AlertSink, SnapshotStore};
pub use annotate::Overlay;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CamwatchConfig;
pub use detect::{BackendRegistry, BoundingBox, Detection, DetectorBackend, StubBackend};
pub use error::{AssetError, RegistryError, SnapshotError, SourceError};
pub use frame::{AnnotatedFrame, Frame};
pub use ingest::{open_source, CaptureSettings, FrameSource, SourceDescriptor};
pub use publish::{FrameBroadcaster, Recv, StreamEnd, StreamPublisher, Subscription};
pub use registry::{CameraListing, CameraRegistry};
pub use session::{CameraSession, RetryPolicy, SessionContext, SessionState, SessionStatus};

/// Register every compiled-in backend and return the one the config selects, warmed up.
pub fn build_detector(cfg: &config::DetectionSettings) -> Result<Arc<dyn DetectorBackend>> {
    let mut backends = BackendRegistry::new();
    backends.register(StubBackend::new());
    #[cfg(feature = "backend-tract")]
    if cfg.backend == "tract" {
        let tract = detect::TractBackend::new(&cfg.model_path, cfg.input_size)?.with_iou(cfg.iou);
        backends.register(tract);
    }
    backends.set_default(&cfg.backend)?;
    let detector = backends
        .default_backend()
        .ok_or_else(|| anyhow!("no detector backend registered"))?;
    detector.warm_up()?;
    log::info!("detector backend: {}", detector.name());
    Ok(detector)
}

/// Load the shared collaborators every camera session needs.
///
/// Optional assets (alert sound, overlay font) degrade with a warning; the
/// detector and the snapshot directory are required.
pub fn build_session_context(cfg: &CamwatchConfig) -> Result<SessionContext> {
    let detector = build_detector(&cfg.detection)?;
    let overlay = Overlay::load(&cfg.detection.monitored_label, cfg.font_path.as_deref());
    if !overlay.has_text() {
        log::warn!("overlay draws boxes only; captions and banner are off");
    }
    let alert_sink = alert::load_alert_sink(&cfg.alert.player, &cfg.alert.sound_path);
    let snapshots = SnapshotStore::new(&cfg.snapshot_dir)?;
    log::info!("snapshots go to {}", snapshots.dir().display());

    Ok(SessionContext {
        detector,
        overlay: Arc::new(overlay),
        alert_sink,
        snapshots,
        clock: Arc::new(SystemClock),
        confidence: cfg.detection.confidence,
        jpeg_quality: cfg.jpeg_quality,
        alert_cooldown: cfg.alert.cooldown,
        snapshot_cooldown: cfg.alert.snapshot_cooldown,
        retry: cfg.retry,
    })
}
