//! Error taxonomy shared by the capture, registry and persistence layers.
//!
//! Internal plumbing uses `anyhow`; these typed errors exist where a caller has
//! to branch on the failure kind (retry vs. stop, 404 vs. 409, degrade vs. abort).

use std::path::PathBuf;

use thiserror::Error;

/// Failures produced by a `FrameSource`.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The described device or stream could not be opened.
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// A single missed grab. The caller should pause briefly and retry.
    #[error("transient read failure: {0}")]
    Transient(String),
    /// The source is not expected to recover (closed handle, end of stream).
    #[error("source ended: {0}")]
    Ended(String),
}

/// Control-plane misuse and add-camera failures. None of these change state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("camera '{0}' already exists")]
    DuplicateIdentifier(String),
    #[error("camera '{0}' not found")]
    NotFound(String),
    #[error("invalid camera id '{0}'")]
    InvalidIdentifier(String),
    #[error("failed to open camera: {0}")]
    SourceUnavailable(String),
}

/// An optional startup asset is absent. The owning feature is disabled.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset {path} missing: {reason}")]
    Missing { path: PathBuf, reason: String },
}

/// Snapshot persistence failures. Logged and skipped by the session.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to write snapshot {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(String),
}
