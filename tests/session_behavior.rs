use anyhow::Result;
use image::{Rgb, RgbImage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tempfile::tempdir;

use camwatch::alert::load_alert_sink;
use camwatch::{
    AlertSink, CameraSession, Clock, Detection, DetectorBackend, Frame, FrameSource, ManualClock,
    Overlay, Recv, RetryPolicy, SessionContext, SessionState, SnapshotStore, SourceDescriptor,
    SourceError, StubBackend,
};

enum Step {
    /// Frame with a bright block, captured at the given offset in ms.
    Person(u64),
    Empty(u64),
    /// Bright frame too wide for a JPEG header.
    Oversized(u64),
    Transient,
}

struct ScriptedSource {
    descriptor: SourceDescriptor,
    steps: VecDeque<Step>,
    clock: Arc<ManualClock>,
    start: SystemTime,
    sequence: u64,
    closed: Arc<AtomicBool>,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>, clock: Arc<ManualClock>) -> Self {
        let start = clock.now();
        Self {
            descriptor: SourceDescriptor::Uri("scripted://test".to_string()),
            steps: steps.into(),
            clock,
            start,
            sequence: 0,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }

    fn frame(&mut self, at_ms: u64, person: bool) -> Frame {
        self.advance(at_ms);
        let mut image = RgbImage::from_pixel(64, 48, Rgb([20, 20, 30]));
        if person {
            for y in 10..30 {
                for x in 20..32 {
                    image.put_pixel(x, y, Rgb([240, 240, 240]));
                }
            }
        }
        Frame::new(image, self.sequence)
    }

    fn oversized(&mut self, at_ms: u64) -> Frame {
        self.advance(at_ms);
        Frame::new(RgbImage::from_pixel(70_000, 2, Rgb([240, 240, 240])), self.sequence)
    }

    fn advance(&mut self, at_ms: u64) {
        self.clock.set(self.start + Duration::from_millis(at_ms));
        self.sequence += 1;
    }
}

impl FrameSource for ScriptedSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        match self.steps.pop_front() {
            Some(Step::Person(ms)) => Ok(self.frame(ms, true)),
            Some(Step::Empty(ms)) => Ok(self.frame(ms, false)),
            Some(Step::Oversized(ms)) => Ok(self.oversized(ms)),
            Some(Step::Transient) => Err(SourceError::Transient("missed grab".to_string())),
            None => Err(SourceError::Ended("script finished".to_string())),
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct CountingSink {
    plays: AtomicUsize,
}

impl AlertSink for CountingSink {
    fn play(&self) {
        self.plays.fetch_add(1, Ordering::SeqCst);
    }
}

struct FailingDetector;

impl DetectorBackend for FailingDetector {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn detect(&self, _frame: &RgbImage, _threshold: f32) -> Result<Vec<Detection>> {
        Err(anyhow::anyhow!("inference exploded"))
    }
}

fn context(
    snapshots: SnapshotStore,
    clock: Arc<ManualClock>,
    sink: Arc<dyn AlertSink>,
) -> SessionContext {
    SessionContext {
        detector: Arc::new(StubBackend::new()),
        overlay: Arc::new(Overlay::boxes_only("person")),
        alert_sink: sink,
        snapshots,
        clock,
        confidence: 0.6,
        jpeg_quality: 70,
        alert_cooldown: Duration::from_secs(3),
        snapshot_cooldown: Duration::from_secs(5),
        retry: RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            max_consecutive_failures: 5,
        },
    }
}

fn wait_for_state(session: &CameraSession, state: SessionState) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if session.status().state == state {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn snapshot_count(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

#[test]
fn side_effects_are_rate_limited_at_thirty_fps() -> Result<()> {
    let dir = tempdir()?;
    let store = SnapshotStore::new(dir.path().join("detected_persons"))?;
    let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
    let sink = Arc::new(CountingSink::default());

    // 10 simulated seconds at 30 frames per second, a person in every frame
    let steps = (0..300u64).map(|i| Step::Person(i * 1000 / 30)).collect();
    let source = ScriptedSource::new(steps, clock.clone());
    let session = CameraSession::start(
        "cam1",
        Box::new(source),
        context(store.clone(), clock, sink.clone()),
    )?;

    assert!(wait_for_state(&session, SessionState::Stopped));
    let status = session.status();
    assert_eq!(status.frames_published, 300);
    assert_eq!(sink.plays.load(Ordering::SeqCst), 4);
    assert_eq!(status.alerts_fired, 4);
    assert_eq!(status.snapshots_saved, 2);
    assert_eq!(snapshot_count(store.dir()), 2);
    Ok(())
}

#[test]
fn no_person_means_no_side_effects() -> Result<()> {
    let dir = tempdir()?;
    let store = SnapshotStore::new(dir.path())?;
    let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
    let sink = Arc::new(CountingSink::default());

    let steps = (0..60u64).map(|i| Step::Empty(i * 100)).collect();
    let session = CameraSession::start(
        "cam1",
        Box::new(ScriptedSource::new(steps, clock.clone())),
        context(store.clone(), clock, sink.clone()),
    )?;

    assert!(wait_for_state(&session, SessionState::Stopped));
    assert_eq!(session.status().frames_published, 60);
    assert_eq!(sink.plays.load(Ordering::SeqCst), 0);
    assert_eq!(snapshot_count(store.dir()), 0);
    Ok(())
}

#[test]
fn transient_failures_do_not_end_the_session() -> Result<()> {
    let dir = tempdir()?;
    let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
    let sink = Arc::new(CountingSink::default());

    let steps = vec![
        Step::Empty(0),
        Step::Transient,
        Step::Transient,
        Step::Empty(100),
        Step::Transient,
        Step::Transient,
        Step::Transient,
        Step::Transient,
        Step::Empty(200),
    ];
    let source = ScriptedSource::new(steps, clock.clone());
    let closed = source.closed_flag();
    let session = CameraSession::start(
        "cam1",
        Box::new(source),
        context(SnapshotStore::new(dir.path())?, clock, sink),
    )?;

    assert!(wait_for_state(&session, SessionState::Stopped));
    let status = session.status();
    // all three good frames made it through the failure streaks
    assert_eq!(status.frames_published, 3);
    assert_eq!(
        status.last_error.as_deref(),
        Some("source ended: script finished")
    );
    assert!(closed.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn unresponsive_source_stops_with_last_error() -> Result<()> {
    let dir = tempdir()?;
    let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
    let sink = Arc::new(CountingSink::default());

    let steps = (0..10).map(|_| Step::Transient).collect();
    let source = ScriptedSource::new(steps, clock.clone());
    let closed = source.closed_flag();
    let session = CameraSession::start(
        "cam1",
        Box::new(source),
        context(SnapshotStore::new(dir.path())?, clock, sink),
    )?;

    assert!(wait_for_state(&session, SessionState::Stopped));
    let status = session.status();
    assert!(!status.state.is_active());
    assert!(status
        .last_error
        .as_deref()
        .unwrap_or_default()
        .starts_with("source unresponsive"));
    assert!(closed.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn stop_request_is_observed_and_releases_the_source() -> Result<()> {
    let dir = tempdir()?;
    let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
    let sink = Arc::new(CountingSink::default());

    let source = camwatch::open_source(
        &SourceDescriptor::parse("stub://porch?fps=50"),
        &camwatch::CaptureSettings::default(),
    )?;
    let session = CameraSession::start(
        "porch",
        source,
        context(SnapshotStore::new(dir.path())?, clock, sink),
    )?;
    assert!(wait_for_state(&session, SessionState::Running));

    let started = Instant::now();
    assert!(session.stop_and_wait(Duration::from_secs(5)));
    assert!(started.elapsed() < Duration::from_secs(2));
    let status = session.status();
    assert_eq!(status.state, SessionState::Stopped);
    assert!(status.last_error.is_none());
    Ok(())
}

#[test]
fn subscribers_see_frames_in_capture_order() -> Result<()> {
    let dir = tempdir()?;
    let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
    let sink = Arc::new(CountingSink::default());

    let source = camwatch::open_source(
        &SourceDescriptor::parse("stub://yard?fps=100&frames=40"),
        &camwatch::CaptureSettings::default(),
    )?;
    let session = CameraSession::start(
        "yard",
        source,
        context(SnapshotStore::new(dir.path())?, clock, sink),
    )?;
    let subscription = session.subscribe();

    let mut last = 0u64;
    let mut received = 0usize;
    loop {
        match subscription.next_frame(Duration::from_secs(5)) {
            Recv::Frame(frame) => {
                assert_eq!(frame.camera_id(), "yard");
                assert!(frame.sequence() > last);
                assert_eq!(&frame.jpeg()[..2], &[0xFF, 0xD8]);
                last = frame.sequence();
                received += 1;
            }
            Recv::Closed => break,
            Recv::Timeout => panic!("session stalled"),
        }
    }
    assert!(received > 0);
    assert_eq!(session.status().frames_published, 40);
    Ok(())
}

#[test]
fn detector_and_snapshot_failures_do_not_stop_the_loop() -> Result<()> {
    let dir = tempdir()?;
    let store = SnapshotStore::new(dir.path().join("snaps"))?;
    // snapshot directory vanishes and is replaced by a file
    std::fs::remove_dir(store.dir())?;
    std::fs::write(store.dir(), b"blocked")?;

    let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
    let sink = Arc::new(CountingSink::default());
    let steps = (0..20u64).map(|i| Step::Person(i * 1000)).collect();
    let session = CameraSession::start(
        "cam1",
        Box::new(ScriptedSource::new(steps, clock.clone())),
        context(store, clock.clone(), sink.clone()),
    )?;
    assert!(wait_for_state(&session, SessionState::Stopped));
    let status = session.status();
    assert_eq!(status.frames_published, 20);
    assert_eq!(status.snapshots_saved, 0);
    assert!(sink.plays.load(Ordering::SeqCst) > 0);

    let mut ctx = context(SnapshotStore::new(dir.path())?, clock.clone(), sink);
    ctx.detector = Arc::new(FailingDetector);
    let steps = (0..5u64).map(|i| Step::Person(i * 100)).collect();
    let session = CameraSession::start(
        "cam2",
        Box::new(ScriptedSource::new(steps, clock)),
        ctx,
    )?;
    assert!(wait_for_state(&session, SessionState::Stopped));
    assert_eq!(session.status().frames_published, 5);
    assert_eq!(session.status().alerts_fired, 0);
    Ok(())
}

#[test]
fn missing_alert_sound_keeps_snapshot_cadence() -> Result<()> {
    let dir = tempdir()?;
    let store = SnapshotStore::new(dir.path().join("detected_persons"))?;
    let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
    let sink = load_alert_sink(&["true".to_string()], &dir.path().join("alert.mp3"));
    assert!(!sink.is_enabled());

    let steps = (0..300u64).map(|i| Step::Person(i * 1000 / 30)).collect();
    let session = CameraSession::start(
        "cam1",
        Box::new(ScriptedSource::new(steps, clock.clone())),
        context(store.clone(), clock, sink),
    )?;

    assert!(wait_for_state(&session, SessionState::Stopped));
    let status = session.status();
    assert_eq!(status.frames_published, 300);
    assert_eq!(status.snapshots_saved, 2);
    let mut names: Vec<String> = std::fs::read_dir(store.dir())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names.len(), 2);
    assert!(names.iter().all(|n| n.starts_with("cam1_person_") && n.ends_with(".jpg")));
    assert_ne!(names[0], names[1]);
    Ok(())
}

#[test]
fn unencodable_frames_do_not_spend_cooldowns() -> Result<()> {
    let dir = tempdir()?;
    let store = SnapshotStore::new(dir.path())?;
    let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
    let sink = Arc::new(CountingSink::default());

    let steps = vec![Step::Oversized(0), Step::Person(100)];
    let session = CameraSession::start(
        "cam1",
        Box::new(ScriptedSource::new(steps, clock.clone())),
        context(store.clone(), clock, sink.clone()),
    )?;

    assert!(wait_for_state(&session, SessionState::Stopped));
    let status = session.status();
    assert_eq!(status.frames_published, 1);
    assert_eq!(sink.plays.load(Ordering::SeqCst), 1);
    assert_eq!(status.alerts_fired, 1);
    assert_eq!(status.snapshots_saved, 1);
    assert_eq!(snapshot_count(store.dir()), 1);
    Ok(())
}
