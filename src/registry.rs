//! Process-wide camera id to session map.
//!
//! Mutations take the write lock only for the map update itself. Opening a
//! source and joining a stopping session both happen outside the lock, so a
//! slow camera never stalls `list` or operations on other cameras. An id being
//! added is reserved before its source opens; a concurrent add of the same id
//! fails as a duplicate without touching the device.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{RegistryError, SourceError};
use crate::ingest::{open_source, CaptureSettings, FrameSource, SourceDescriptor};
use crate::publish::Subscription;
use crate::session::{CameraSession, SessionContext, SessionState};

pub const MAX_ID_LEN: usize = 64;

type SourceOpener = dyn Fn(&SourceDescriptor, &CaptureSettings) -> Result<Box<dyn FrameSource>, SourceError>
    + Send
    + Sync;

/// One row of `list`.
#[derive(Clone, Debug, Serialize)]
pub struct CameraListing {
    pub id: String,
    pub active: bool,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub source: String,
}

pub struct CameraRegistry {
    sessions: RwLock<HashMap<String, Arc<CameraSession>>>,
    /// Ids whose source is being opened. Locked only while `sessions` is write-locked
    /// or on its own, never the other way round.
    pending: Mutex<HashSet<String>>,
    ctx: SessionContext,
    capture: CaptureSettings,
    stop_timeout: Duration,
    opener: Box<SourceOpener>,
}

impl CameraRegistry {
    pub fn new(ctx: SessionContext, capture: CaptureSettings, stop_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            ctx,
            capture,
            stop_timeout,
            opener: Box::new(open_source),
        }
    }

    /// Replace how descriptors become sources.
    pub fn with_opener<F>(mut self, opener: F) -> Self
    where
        F: Fn(&SourceDescriptor, &CaptureSettings) -> Result<Box<dyn FrameSource>, SourceError>
            + Send
            + Sync
            + 'static,
    {
        self.opener = Box::new(opener);
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<CameraSession>>> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<CameraSession>>> {
        self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `id` for an add in progress. Fails when a live session or another add holds it.
    fn reserve(&self, id: &str) -> Result<Reservation<'_>, RegistryError> {
        let sessions = self.write();
        let live = sessions
            .get(id)
            .map(|s| s.status().state != SessionState::Stopped)
            .unwrap_or(false);
        if live || !self.pending().insert(id.to_string()) {
            return Err(RegistryError::DuplicateIdentifier(id.to_string()));
        }
        Ok(Reservation {
            registry: self,
            id: id.to_string(),
        })
    }

    /// Open `descriptor` and start a session for it under `id`.
    ///
    /// An id whose session already ended on its own is reused.
    pub fn add(&self, id: &str, descriptor: &SourceDescriptor) -> Result<(), RegistryError> {
        validate_id(id)?;
        let reservation = self.reserve(id)?;
        if stub_detector_on_live_feed(self.ctx.detector.name(), descriptor) {
            log::warn!(
                "camera {}: the stub detector reports any bright region of {} as a person; \
                 set detection.backend = \"tract\" for real cameras",
                id,
                descriptor
            );
        }

        let source = (self.opener)(descriptor, &self.capture)
            .map_err(|err| RegistryError::SourceUnavailable(err.to_string()))?;
        let session = CameraSession::start(id, source, self.ctx.clone())
            .map_err(|err| RegistryError::SourceUnavailable(format!("{:#}", err)))?;

        let mut sessions = self.write();
        if let Some(previous) = sessions.insert(id.to_string(), Arc::new(session)) {
            log::debug!("camera {} replaced stopped session", previous.id());
        }
        drop(reservation);
        Ok(())
    }

    /// Take `id` out of the registry, stop its session and wait for the device to be released.
    pub fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let session = self
            .write()
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        session.stop_and_wait(self.stop_timeout);
        log::info!("camera {} removed", id);
        Ok(())
    }

    /// Every registered camera, sorted by id.
    pub fn list(&self) -> Vec<CameraListing> {
        let mut listing: Vec<CameraListing> = self
            .read()
            .values()
            .map(|session| {
                let status = session.status();
                CameraListing {
                    id: session.id().to_string(),
                    active: status.state.is_active(),
                    state: status.state,
                    last_error: status.last_error,
                    source: session.source_label().to_string(),
                }
            })
            .collect();
        listing.sort_by(|a, b| a.id.cmp(&b.id));
        listing
    }

    pub fn get(&self, id: &str) -> Option<Arc<CameraSession>> {
        self.read().get(id).cloned()
    }

    pub fn subscribe(&self, id: &str) -> Result<Subscription, RegistryError> {
        self.get(id)
            .map(|session| session.subscribe())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Stop every session at once and wait for all of them until a shared deadline.
    ///
    /// Returns the ids that were still running when the deadline passed.
    pub fn shutdown(&self, timeout: Duration) -> Vec<String> {
        let sessions: Vec<Arc<CameraSession>> = self.write().drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return Vec::new();
        }
        log::info!("stopping {} camera(s)", sessions.len());
        for session in &sessions {
            session.request_stop();
        }
        let deadline = Instant::now() + timeout;
        let mut stragglers = Vec::new();
        for session in &sessions {
            if !session.wait_stopped(deadline) {
                log::warn!("camera {} still running at shutdown deadline", session.id());
                stragglers.push(session.id().to_string());
            }
        }
        stragglers
    }
}

impl Drop for CameraRegistry {
    fn drop(&mut self) {
        for session in self.write().values() {
            session.request_stop();
        }
    }
}

/// Holds an id in `pending` until dropped.
struct Reservation<'a> {
    registry: &'a CameraRegistry,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.registry.pending().remove(&self.id);
    }
}

/// The stub backend only makes sense on synthetic `stub://` feeds.
fn stub_detector_on_live_feed(detector: &str, descriptor: &SourceDescriptor) -> bool {
    detector == "stub" && !descriptor.is_synthetic()
}

/// Ids travel in URL paths and file names: non-empty, bounded, no separators or controls.
pub fn validate_id(id: &str) -> Result<(), RegistryError> {
    let ok = !id.trim().is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.chars().any(|c| c.is_control() || c == '/' || c == '\\' || c == '?' || c == '#');
    if ok {
        Ok(())
    } else {
        Err(RegistryError::InvalidIdentifier(id.to_string()))
    }
}
