//! Per-camera side effects of a person detection.
//!
//! `AlertPolicy` decides, `AlertSink` makes the noise, `SnapshotStore` keeps the evidence.

mod policy;
mod snapshot;
mod sound;

pub use policy::{AlertDecision, AlertPolicy};
pub use snapshot::{sanitize_identifier, SnapshotStore};
pub use sound::{load_alert_sink, AlertSink, CommandAlertSink, NoopAlertSink};
