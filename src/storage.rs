//! Storage service — free-space queries and age-based cleanup.
//!
//! Consumed by the rotator's pre-flight path validation and by the
//! `DISK_FULL` fault handler. Deletion is file-by-file and oldest-first, so
//! a concurrent caller never observes a half-deleted batch.

use std::path::Path;
use std::time::SystemTime;

use tracing::{info, warn};

use crate::error::{NvrError, Result};

/// Query free space on the filesystem backing `path`, in gigabytes.
pub fn free_space_gb(path: &Path) -> Result<f64> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| NvrError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
    let free_bytes = stat.blocks_available() as u128 * stat.fragment_size() as u128;
    Ok(free_bytes as f64 / 1_073_741_824.0)
}

/// Delete files under `root` older than `max_age_days`, oldest first, until
/// either `min_free_target_gb` is reached or there is nothing left to
/// delete. Returns the number of files deleted. Safe to call concurrently
/// from multiple cameras — each deletion is an independent atomic
/// `remove_file`, so racing callers never corrupt each other's state, they
/// simply may both attempt (and one will get `NotFound`, which is ignored).
pub fn auto_cleanup(root: &Path, max_age_days: u64, min_free_target_gb: f64) -> Result<usize> {
    let max_age = std::time::Duration::from_secs(max_age_days * 86_400);
    let now = SystemTime::now();

    let mut candidates: Vec<(SystemTime, std::path::PathBuf)> = Vec::new();
    collect_files(root, &mut candidates)?;
    candidates.sort_by_key(|(mtime, _)| *mtime);

    let mut deleted = 0usize;
    for (mtime, path) in candidates {
        if free_space_gb(root).unwrap_or(0.0) >= min_free_target_gb {
            break;
        }
        let age = now.duration_since(mtime).unwrap_or_default();
        if age < max_age {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                deleted += 1;
                info!(path = ?path, "auto_cleanup removed aged-out segment");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = ?path, error = %e, "auto_cleanup failed to remove segment");
            }
        }
    }
    Ok(deleted)
}

fn collect_files(dir: &Path, out: &mut Vec<(SystemTime, std::path::PathBuf)>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            collect_files(&path, out)?;
        } else if meta.is_file() {
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((mtime, path));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn free_space_gb_is_positive_for_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let gb = free_space_gb(dir.path()).expect("statvfs should succeed");
        assert!(gb >= 0.0);
    }

    #[test]
    fn auto_cleanup_deletes_oldest_first_until_target_met() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            let p = dir.path().join(format!("seg{i}.mp4"));
            std::fs::write(&p, vec![0u8; 1024]).unwrap();
        }
        // With a target far beyond any real free space, deletion continues
        // until max_age excludes everything (age 0 here < max_age_days=7).
        let deleted = auto_cleanup(dir.path(), 7, f64::MAX).unwrap_or(0);
        assert_eq!(deleted, 0, "freshly written files are never aged out");
    }

    #[test]
    fn auto_cleanup_removes_aged_out_files_when_age_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            let p = dir.path().join(format!("seg{i}.mp4"));
            std::fs::write(&p, vec![0u8; 1024]).unwrap();
        }
        // max_age_days = 0 means everything is immediately eligible.
        let deleted = auto_cleanup(dir.path(), 0, f64::MAX).unwrap();
        assert_eq!(deleted, 3);
        let remaining = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn auto_cleanup_stops_once_target_free_space_reached() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            let p = dir.path().join(format!("seg{i}.mp4"));
            std::fs::write(&p, vec![0u8; 1024]).unwrap();
        }
        // A target of 0 GB is already satisfied, so nothing should be removed.
        let deleted = auto_cleanup(dir.path(), 0, 0.0).unwrap();
        assert_eq!(deleted, 0);
        let _ = Duration::from_secs(0);
    }
}
