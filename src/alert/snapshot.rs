use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};

use crate::error::SnapshotError;

const MAX_SUFFIX: u32 = 1000;

/// Writes person snapshots as `{camera_id}_person_{YYYYMMDD_HHMMSS}.jpg`.
///
/// Shared by every session. Files are created exclusively, so two writers can
/// never clobber each other; a name already taken gets a `_N` suffix.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Creates `dir` (and parents) if absent.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(
        &self,
        camera_id: &str,
        taken_at: SystemTime,
        jpeg: &[u8],
    ) -> Result<PathBuf, SnapshotError> {
        if jpeg.is_empty() {
            return Err(SnapshotError::Encode("empty snapshot buffer".to_string()));
        }
        let stamp = DateTime::<Local>::from(taken_at).format("%Y%m%d_%H%M%S");
        let stem = format!("{}_person_{}", sanitize_identifier(camera_id), stamp);

        for attempt in 0..MAX_SUFFIX {
            let name = if attempt == 0 {
                format!("{}.jpg", stem)
            } else {
                format!("{}_{}.jpg", stem, attempt)
            };
            let path = self.dir.join(name);
            let file = OpenOptions::new().write(true).create_new(true).open(&path);
            let mut file = match file {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(SnapshotError::WriteFailure { path, source }),
            };
            if let Err(source) = file.write_all(jpeg).and_then(|_| file.sync_data()) {
                let _ = fs::remove_file(&path);
                return Err(SnapshotError::WriteFailure { path, source });
            }
            return Ok(path);
        }
        Err(SnapshotError::WriteFailure {
            path: self.dir.join(format!("{}.jpg", stem)),
            source: io::Error::new(io::ErrorKind::AlreadyExists, "snapshot names exhausted"),
        })
    }
}

/// Keep `[A-Za-z0-9_-]`, replace everything else with `_`.
pub fn sanitize_identifier(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "camera".to_string()
    } else {
        cleaned
    }
}
