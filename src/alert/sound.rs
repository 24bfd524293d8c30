use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::error::AssetError;

/// Audible alert output. `play` must return immediately.
pub trait AlertSink: Send + Sync {
    fn play(&self);

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Used when the alert asset is unavailable.
pub struct NoopAlertSink;

impl AlertSink for NoopAlertSink {
    fn play(&self) {}

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Plays the alert file through an external player process.
///
/// At most one playback runs at a time; overlapping requests are dropped.
pub struct CommandAlertSink {
    program: String,
    args: Vec<String>,
    sound_path: PathBuf,
    playing: Arc<AtomicBool>,
}

impl CommandAlertSink {
    /// `player` is the argv prefix; the sound path is appended as the last argument.
    pub fn new(player: &[String], sound_path: &Path) -> Result<Self, AssetError> {
        let (program, args) = player.split_first().ok_or_else(|| AssetError::Missing {
            path: sound_path.to_path_buf(),
            reason: "no alert player configured".to_string(),
        })?;
        match std::fs::metadata(sound_path) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(AssetError::Missing {
                    path: sound_path.to_path_buf(),
                    reason: "not a regular file".to_string(),
                })
            }
            Err(err) => {
                return Err(AssetError::Missing {
                    path: sound_path.to_path_buf(),
                    reason: err.to_string(),
                })
            }
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            sound_path: sound_path.to_path_buf(),
            playing: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl AlertSink for CommandAlertSink {
    fn play(&self) {
        if self.playing.swap(true, Ordering::AcqRel) {
            log::debug!("alert already playing; skipped");
            return;
        }
        let spawned = Command::new(&self.program)
            .args(&self.args)
            .arg(&self.sound_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(mut child) => {
                let playing = Arc::clone(&self.playing);
                // reap the player so it does not linger as a zombie
                thread::spawn(move || {
                    if let Err(err) = child.wait() {
                        log::debug!("alert player wait failed: {}", err);
                    }
                    playing.store(false, Ordering::Release);
                });
            }
            Err(err) => {
                self.playing.store(false, Ordering::Release);
                log::warn!("failed to start alert player {}: {}", self.program, err);
            }
        }
    }
}

/// Build the process-wide alert sink, degrading to a no-op when the asset is missing.
pub fn load_alert_sink(player: &[String], sound_path: &Path) -> Arc<dyn AlertSink> {
    match CommandAlertSink::new(player, sound_path) {
        Ok(sink) => {
            log::info!("audible alert enabled ({})", sound_path.display());
            Arc::new(sink)
        }
        Err(err) => {
            log::warn!("audible alert disabled: {}", err);
            Arc::new(NoopAlertSink)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sound_file_degrades_to_noop() {
        let dir = tempfile::tempdir().unwrap();
        let player = vec!["true".to_string()];
        let err = CommandAlertSink::new(&player, &dir.path().join("alert.mp3")).err();
        assert!(matches!(err, Some(AssetError::Missing { .. })));
        let sink = load_alert_sink(&player, &dir.path().join("alert.mp3"));
        assert!(!sink.is_enabled());
        sink.play();
    }

    #[test]
    fn empty_player_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sound = dir.path().join("alert.mp3");
        std::fs::write(&sound, b"ID3").unwrap();
        assert!(CommandAlertSink::new(&[], &sound).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn play_runs_the_player_with_the_sound_path() {
        let dir = tempfile::tempdir().unwrap();
        let sound = dir.path().join("alert.mp3");
        std::fs::write(&sound, b"ID3").unwrap();
        let marker = dir.path().join("played");
        let script = format!(
            "cp \"$0\" {m}.tmp && mv {m}.tmp {m}",
            m = marker.display()
        );
        let player = vec!["sh".to_string(), "-c".to_string(), script];
        let sink = CommandAlertSink::new(&player, &sound).unwrap();
        assert!(sink.is_enabled());
        sink.play();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !marker.exists() && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(std::fs::read(&marker).unwrap(), b"ID3");
    }
}
