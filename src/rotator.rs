//! Recording file rotator.
//!
//! Owns the naming callback contract for `splitmuxsink`'s
//! `format-location-full` signal, pre-flight path validation before
//! recording starts, and the corrupted-segment cleanup policy applied when
//! recording resumes after a storage fault.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tracing::{error, info, warn};

use crate::error::{NvrError, Result};
use crate::fault::FaultKind;

/// Invoked when the naming callback fails inside the media event loop. Must
/// be cheap and non-blocking: it only schedules a fault, never handles it
/// synchronously.
pub type FaultScheduler = Arc<dyn Fn(FaultKind) + Send + Sync>;

pub struct Rotator {
    root: PathBuf,
    camera_id: String,
    extension: &'static str,
    fault_scheduler: FaultScheduler,
}

impl Rotator {
    pub fn new(
        root: PathBuf,
        camera_id: impl Into<String>,
        extension: &'static str,
        fault_scheduler: FaultScheduler,
    ) -> Self {
        Self {
            root,
            camera_id: camera_id.into(),
            extension,
            fault_scheduler,
        }
    }

    /// The naming callback handed to `splitmuxsink`'s `format-location-full`
    /// signal. Never panics: any filesystem failure is logged at CRITICAL,
    /// schedules a `STORAGE_DISCONNECTED` fault, and falls back to a benign
    /// temp-directory path so the muxer is never handed an empty string.
    pub fn location_for_segment(&self, _fragment_id: u32) -> String {
        match self.try_location_for_segment() {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(e) => {
                error!(
                    camera = self.camera_id,
                    error = %e,
                    critical = true,
                    "naming callback failed to create segment directory"
                );
                (self.fault_scheduler)(FaultKind::StorageDisconnected);
                self.fallback_path().to_string_lossy().into_owned()
            }
        }
    }

    fn try_location_for_segment(&self) -> Result<PathBuf> {
        let now = Local::now();
        let day_dir = self.root.join(&self.camera_id).join(now.format("%Y%m%d").to_string());
        std::fs::create_dir_all(&day_dir)?;
        let filename = format!(
            "{}_{}.{}",
            self.camera_id,
            now.format("%Y%m%d_%H%M%S"),
            self.extension
        );
        Ok(day_dir.join(filename))
    }

    fn fallback_path(&self) -> PathBuf {
        let dir = std::env::temp_dir().join("nvr-pipeline-fallback").join(&self.camera_id);
        let _ = std::fs::create_dir_all(&dir);
        dir.join(format!("fallback_{}.{}", Local::now().format("%Y%m%d_%H%M%S"), self.extension))
    }

    /// Pre-flight path validation, required before recording can start.
    /// Validates (and creates) both the camera directory and today's dated
    /// subdirectory, since that is the directory `start_recording` promises
    /// is writable the instant it returns `true` — the naming callback only
    /// resolves the dated directory lazily, on the muxer's first segment,
    /// which can run arbitrarily later. Returns `Ok(())` only if every step
    /// succeeds; the caller (Branch Controller, via `start_recording`) must
    /// not touch the recording valve on failure.
    pub fn validate_preflight(&self, min_free_gb: f64) -> Result<()> {
        let camera_dir = self.root.join(&self.camera_id);
        let day_dir = camera_dir.join(Local::now().format("%Y%m%d").to_string());
        std::fs::create_dir_all(&day_dir)?;

        self.check_mount_point(&day_dir)?;
        self.check_permissions(&day_dir)?;

        let free_gb = crate::storage::free_space_gb(&day_dir)?;
        if free_gb < min_free_gb {
            return Err(NvrError::PathValidation(format!(
                "only {free_gb:.2} GB free, require >= {min_free_gb:.2} GB"
            )));
        }

        self.probe_write(&day_dir)?;
        Ok(())
    }

    /// If `target_dir` lives under a well-known removable-media mount
    /// point, verify that mount point is actually mounted. Hosts without
    /// removable-media mounts (the common case) pass trivially.
    fn check_mount_point(&self, target_dir: &Path) -> Result<()> {
        const REMOVABLE_ROOTS: &[&str] = &["/media", "/mnt", "/run/media"];
        for root in REMOVABLE_ROOTS {
            if target_dir.starts_with(root) {
                // A removable mount point is "mounted" iff it resolves to a
                // filesystem boundary distinct from its parent; the cheapest
                // portable check available without extra crates is simply
                // that the directory exists and is readable.
                if !Path::new(root).exists() {
                    return Err(NvrError::PathValidation(format!(
                        "removable-media mount point {root} is not mounted"
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_permissions(&self, target_dir: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(target_dir)?;
        let mode = meta.permissions().mode();
        // Owner rwx bits; the process is expected to run as the directory owner.
        if mode & 0o700 != 0o700 {
            return Err(NvrError::PathValidation(format!(
                "insufficient rwx permission on {}: mode {:o}",
                target_dir.display(),
                mode
            )));
        }
        Ok(())
    }

    fn probe_write(&self, target_dir: &Path) -> Result<()> {
        let probe = target_dir.join(".nvr-probe");
        std::fs::write(&probe, [])?;
        std::fs::remove_file(&probe)?;
        Ok(())
    }

    /// Corrupted-segment policy: when recording resumes after a storage
    /// fault, delete `last_segment` if and only if it is zero bytes.
    /// Non-zero truncated segments are retained.
    pub fn cleanup_last_segment_if_empty(&self, last_segment: &Path) {
        match std::fs::metadata(last_segment) {
            Ok(meta) if meta.len() == 0 => match std::fs::remove_file(last_segment) {
                Ok(()) => info!(
                    camera = self.camera_id,
                    path = ?last_segment,
                    "removed zero-byte segment left by storage disconnect"
                ),
                Err(e) => warn!(
                    camera = self.camera_id,
                    path = ?last_segment,
                    error = %e,
                    "failed to remove zero-byte segment"
                ),
            },
            Ok(_) => {
                info!(
                    camera = self.camera_id,
                    path = ?last_segment,
                    "retaining non-zero truncated segment"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                camera = self.camera_id,
                path = ?last_segment,
                error = %e,
                "could not stat last segment for cleanup"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_scheduler() -> FaultScheduler {
        Arc::new(|_| {})
    }

    #[test]
    fn naming_round_trip_produces_parseable_filename() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = Rotator::new(dir.path().to_path_buf(), "cam1", "mp4", noop_scheduler());
        let location = rotator.location_for_segment(0);
        let path = PathBuf::from(&location);

        let filename = path.file_name().unwrap().to_str().unwrap();
        assert!(filename.starts_with("cam1_"));
        assert!(filename.ends_with(".mp4"));

        let stem = filename.strip_prefix("cam1_").unwrap().strip_suffix(".mp4").unwrap();
        // `{YYYYMMDD}_{HHMMSS}` — 8 digits, underscore, 6 digits.
        assert_eq!(stem.len(), 15);
        assert!(stem.chars().nth(8) == Some('_'));
    }

    #[test]
    fn naming_callback_creates_today_directory() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = Rotator::new(dir.path().to_path_buf(), "cam1", "mp4", noop_scheduler());
        let location = rotator.location_for_segment(0);
        let today = Local::now().format("%Y%m%d").to_string();
        assert!(dir.path().join("cam1").join(&today).exists());
        assert!(PathBuf::from(&location).starts_with(dir.path().join("cam1").join(&today)));
    }

    #[test]
    fn preflight_fails_when_free_space_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = Rotator::new(dir.path().to_path_buf(), "cam1", "mp4", noop_scheduler());
        // An absurdly high floor guarantees failure on any real filesystem.
        let result = rotator.validate_preflight(f64::MAX);
        assert!(result.is_err());
    }

    #[test]
    fn preflight_succeeds_with_a_small_floor() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = Rotator::new(dir.path().to_path_buf(), "cam1", "mp4", noop_scheduler());
        let result = rotator.validate_preflight(0.0);
        assert!(result.is_ok());
    }

    #[test]
    fn cleanup_removes_only_zero_byte_segment() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = Rotator::new(dir.path().to_path_buf(), "cam1", "mp4", noop_scheduler());

        let empty = dir.path().join("empty.mp4");
        std::fs::write(&empty, []).unwrap();
        let nonempty = dir.path().join("nonempty.mp4");
        std::fs::write(&nonempty, b"data").unwrap();

        rotator.cleanup_last_segment_if_empty(&empty);
        rotator.cleanup_last_segment_if_empty(&nonempty);

        assert!(!empty.exists());
        assert!(nonempty.exists());
    }

    #[test]
    fn naming_failure_schedules_storage_disconnected_fault() {
        let dir = tempfile::tempdir().unwrap();
        // Point root at a path that cannot have subdirectories created under
        // it (a regular file in place of a directory).
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let scheduled = Arc::new(AtomicUsize::new(0));
        let scheduled_clone = scheduled.clone();
        let scheduler: FaultScheduler = Arc::new(move |kind| {
            assert_eq!(kind, FaultKind::StorageDisconnected);
            scheduled_clone.fetch_add(1, Ordering::SeqCst);
        });

        let rotator = Rotator::new(blocker.join("cam1"), "cam1", "mp4", scheduler);
        let _ = rotator.location_for_segment(0);
        assert_eq!(scheduled.load(Ordering::SeqCst), 1);
    }
}
