//! Fan-out of annotated frames to stream subscribers.
//!
//! Each subscriber owns a single-slot mailbox. Publishing overwrites the slot
//! and never waits on a reader, so a slow client misses intermediate frames
//! instead of holding the session back or growing a queue.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::frame::AnnotatedFrame;

pub const BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const WAIT_SLICE: Duration = Duration::from_millis(500);

#[derive(Default)]
struct SlotState {
    latest: Option<Arc<AnnotatedFrame>>,
    closed: bool,
}

struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl FrameSlot {
    fn new(closed: bool) -> Self {
        Self {
            state: Mutex::new(SlotState {
                latest: None,
                closed,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn put(&self, frame: Arc<AnnotatedFrame>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.latest = Some(frame);
        drop(state);
        self.ready.notify_all();
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }
}

/// Outcome of waiting on a subscription.
#[derive(Debug)]
pub enum Recv {
    Frame(Arc<AnnotatedFrame>),
    Timeout,
    /// The producing session is gone. Any frame still in the slot was delivered first.
    Closed,
}

/// Producer side, owned by one camera session.
#[derive(Default)]
pub struct FrameBroadcaster {
    slots: Mutex<Vec<Weak<FrameSlot>>>,
    closed: AtomicBool,
}

impl FrameBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Weak<FrameSlot>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand `frame` to every live subscriber. Dropped subscriptions are pruned here.
    pub fn publish(&self, frame: Arc<AnnotatedFrame>) {
        let mut slots = self.slots();
        slots.retain(|weak| match weak.upgrade() {
            Some(slot) => {
                slot.put(Arc::clone(&frame));
                true
            }
            None => false,
        });
    }

    pub fn subscribe(&self) -> Subscription {
        let mut slots = self.slots();
        // checked under the list lock so close_all cannot miss a new slot
        let slot = Arc::new(FrameSlot::new(self.closed.load(Ordering::Acquire)));
        slots.push(Arc::downgrade(&slot));
        Subscription { slot }
    }

    /// Wake every subscriber with `Closed`. Later subscriptions start closed.
    pub fn close_all(&self) {
        let mut slots = self.slots();
        self.closed.store(true, Ordering::Release);
        for slot in slots.drain(..).filter_map(|weak| weak.upgrade()) {
            slot.close();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut slots = self.slots();
        slots.retain(|weak| weak.strong_count() > 0);
        slots.len()
    }
}

/// Consumer side. Dropping it unsubscribes.
pub struct Subscription {
    slot: Arc<FrameSlot>,
}

impl Subscription {
    /// Take the newest frame, waiting up to `timeout` for one to arrive.
    pub fn next_frame(&self, timeout: Duration) -> Recv {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.lock();
        loop {
            if let Some(frame) = state.latest.take() {
                return Recv::Frame(frame);
            }
            if state.closed {
                return Recv::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Recv::Timeout;
            }
            state = match self.slot.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// Why a stream stopped. Neither case is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    SessionClosed,
    SubscriberDisconnected,
    ServerStopping,
}

/// Serialises one subscription as a `multipart/x-mixed-replace` body.
pub struct StreamPublisher {
    subscription: Subscription,
    stop: Option<Arc<AtomicBool>>,
}

impl StreamPublisher {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            stop: None,
        }
    }

    /// End the stream once `stop` is set.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Write parts until the session closes, the client goes away, or the stop flag is set.
    ///
    /// The HTTP response head is the caller's job; this writes the body only.
    pub fn run<W: Write>(&self, out: &mut W) -> StreamEnd {
        loop {
            if self.stopping() {
                return StreamEnd::ServerStopping;
            }
            match self.subscription.next_frame(WAIT_SLICE) {
                Recv::Frame(frame) => {
                    if let Err(err) = write_part(out, frame.jpeg()) {
                        log::debug!(
                            "stream subscriber for {} disconnected: {}",
                            frame.camera_id(),
                            err
                        );
                        return StreamEnd::SubscriberDisconnected;
                    }
                }
                Recv::Timeout => continue,
                Recv::Closed => return StreamEnd::SessionClosed,
            }
        }
    }

    fn stopping(&self) -> bool {
        self.stop
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// One boundary-delimited JPEG part.
pub fn write_part<W: Write>(out: &mut W, jpeg: &[u8]) -> io::Result<()> {
    write!(out, "--{}\r\nContent-Type: image/jpeg\r\n\r\n", BOUNDARY)?;
    out.write_all(jpeg)?;
    out.write_all(b"\r\n")?;
    out.flush()
}
