//! One camera's capture, detect, annotate, alert and publish loop.
//!
//! Each session runs on its own thread and owns its source and alert state
//! outright. The only shared pieces are the status cell and the frame
//! broadcaster, both behind short critical sections.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::alert::{AlertPolicy, AlertSink, SnapshotStore};
use crate::annotate::Overlay;
use crate::clock::Clock;
use crate::detect::DetectorBackend;
use crate::error::SourceError;
use crate::frame::{encode_jpeg, AnnotatedFrame, Frame};
use crate::ingest::FrameSource;
use crate::publish::{FrameBroadcaster, Subscription};

const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Snapshot of a session as seen by the control plane.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Why the session ended on its own, if it did.
    pub last_error: Option<String>,
    pub frames_published: u64,
    pub alerts_fired: u64,
    pub snapshots_saved: u64,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Starting,
            last_error: None,
            frames_published: 0,
            alerts_fired: 0,
            snapshots_saved: 0,
        }
    }
}

/// Backoff for transient read failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive transient failures after which the source counts as ended.
    pub max_consecutive_failures: u32,
}

impl RetryPolicy {
    /// Delay after the `streak`-th consecutive failure (1-based): doubles from
    /// `initial_backoff`, capped at `max_backoff`.
    pub fn backoff(&self, streak: u32) -> Duration {
        let factor = 1u32
            .checked_shl(streak.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(2000),
            max_consecutive_failures: 150,
        }
    }
}

/// Process-wide collaborators every session is built from.
#[derive(Clone)]
pub struct SessionContext {
    pub detector: Arc<dyn DetectorBackend>,
    pub overlay: Arc<Overlay>,
    pub alert_sink: Arc<dyn AlertSink>,
    pub snapshots: SnapshotStore,
    pub clock: Arc<dyn Clock>,
    pub confidence: f32,
    pub jpeg_quality: u8,
    pub alert_cooldown: Duration,
    pub snapshot_cooldown: Duration,
    pub retry: RetryPolicy,
}

struct Shared {
    stop: AtomicBool,
    status: Mutex<SessionStatus>,
    broadcaster: FrameBroadcaster,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, SessionStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleep for `total`, waking early when a stop is requested.
    fn pause(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.stop_requested() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(STOP_POLL));
        }
    }
}

/// A running camera. Dropping the handle requests a stop but does not wait.
pub struct CameraSession {
    id: String,
    source_label: String,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CameraSession {
    /// Take ownership of an opened source and start the loop on a new thread.
    pub fn start(id: impl Into<String>, source: Box<dyn FrameSource>, ctx: SessionContext) -> Result<Self> {
        let id = id.into();
        let source_label = source.descriptor().to_string();
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            status: Mutex::new(SessionStatus::default()),
            broadcaster: FrameBroadcaster::new(),
        });

        let worker = {
            let worker_id = id.clone();
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("camera-{}", id))
                .spawn(move || run_session(worker_id, source, ctx, shared))
                .with_context(|| format!("failed to spawn session thread for {}", id))?
        };
        log::info!("camera {} starting ({})", id, source_label);

        Ok(Self {
            id,
            source_label,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Redacted source descriptor.
    pub fn source_label(&self) -> &str {
        &self.source_label
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status().clone()
    }

    pub fn subscribe(&self) -> Subscription {
        self.shared.broadcaster.subscribe()
    }

    /// Ask the loop to stop at its next iteration boundary.
    pub fn request_stop(&self) {
        if self.shared.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut status = self.shared.status();
        if status.state.is_active() {
            status.state = SessionState::Stopping;
        }
    }

    /// Wait for the worker to exit until `deadline`. Returns whether it did.
    pub fn wait_stopped(&self, deadline: Instant) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(handle) = worker.as_ref() else {
            return true;
        };
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                log::error!("camera {} worker panicked", self.id);
            }
        }
        true
    }

    pub fn stop_and_wait(&self, timeout: Duration) -> bool {
        self.request_stop();
        let stopped = self.wait_stopped(Instant::now() + timeout);
        if !stopped {
            log::warn!("camera {} did not stop within {:?}", self.id, timeout);
        }
        stopped
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }
}

/// Marks the session stopped however the worker exits, panics included.
struct ExitGuard {
    id: String,
    source: Box<dyn FrameSource>,
    shared: Arc<Shared>,
    end_reason: Option<String>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.shared.status().state = SessionState::Stopping;
        if self.source.is_open() {
            self.source.close();
        }
        self.shared.broadcaster.close_all();
        let mut status = self.shared.status();
        status.state = SessionState::Stopped;
        if thread::panicking() && self.end_reason.is_none() {
            self.end_reason = Some("session worker panicked".to_string());
        }
        match self.end_reason.take() {
            Some(reason) => {
                log::error!("camera {} stopped: {}", self.id, reason);
                status.last_error = Some(reason);
            }
            None => log::info!("camera {} stopped", self.id),
        }
    }
}

fn run_session(id: String, source: Box<dyn FrameSource>, ctx: SessionContext, shared: Arc<Shared>) {
    let mut guard = ExitGuard {
        id,
        source,
        shared,
        end_reason: None,
    };
    {
        let mut status = guard.shared.status();
        if status.state == SessionState::Starting {
            status.state = SessionState::Running;
        }
    }
    guard.end_reason = session_loop(&guard.id, guard.source.as_mut(), &ctx, &guard.shared);
}

/// Returns the reason the session ended on its own, or `None` when asked to stop.
fn session_loop(
    id: &str,
    source: &mut dyn FrameSource,
    ctx: &SessionContext,
    shared: &Shared,
) -> Option<String> {
    let mut policy = AlertPolicy::new(ctx.alert_cooldown, ctx.snapshot_cooldown);
    let monitored = ctx.overlay.monitored_label();
    let mut failures = 0u32;

    loop {
        if shared.stop_requested() {
            return None;
        }

        let Frame { mut image, sequence } = match source.read_frame() {
            Ok(frame) => {
                failures = 0;
                frame
            }
            Err(SourceError::Transient(reason)) => {
                failures += 1;
                if failures == 1 {
                    log::warn!("camera {} read failed, retrying: {}", id, reason);
                } else {
                    log::debug!("camera {} read failed ({} in a row): {}", id, failures, reason);
                }
                if failures >= ctx.retry.max_consecutive_failures {
                    return Some(format!("source unresponsive: {}", reason));
                }
                shared.pause(ctx.retry.backoff(failures));
                continue;
            }
            Err(err) => return Some(err.to_string()),
        };

        // one timestamp for both cooldowns and the snapshot name
        let now = ctx.clock.now();
        let detections = ctx
            .detector
            .detect(&image, ctx.confidence)
            .unwrap_or_else(|err| {
                log::warn!("camera {} detection failed: {:#}", id, err);
                Vec::new()
            });
        let person_present = detections.iter().any(|d| d.is(monitored));

        ctx.overlay.draw(&mut image, &detections, id, person_present);

        let jpeg = match encode_jpeg(&image, ctx.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                log::warn!("camera {} frame {} not encoded: {:#}", id, sequence, err);
                continue;
            }
        };
        // cooldowns only advance for frames that can carry the side effects
        let decision = policy.evaluate(person_present, now);

        if decision.alert {
            ctx.alert_sink.play();
        }
        let mut saved = false;
        if decision.snapshot {
            match ctx.snapshots.save(id, now, &jpeg) {
                Ok(path) => {
                    log::info!("camera {} snapshot saved to {}", id, path.display());
                    saved = true;
                }
                Err(err) => log::warn!("camera {} snapshot skipped: {}", id, err),
            }
        }

        shared
            .broadcaster
            .publish(Arc::new(AnnotatedFrame::new(id, sequence, jpeg)));

        let mut status = shared.status();
        status.frames_published += 1;
        status.alerts_fired += decision.alert as u64;
        status.snapshots_saved += saved as u64;
    }
}
