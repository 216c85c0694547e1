//! Integration tests for the recording file rotator against a real
//! temporary filesystem.

use std::sync::Arc;

use nvr_pipeline::fault::FaultKind;
use nvr_pipeline::rotator::Rotator;

fn noop_scheduler() -> nvr_pipeline::rotator::FaultScheduler {
    Arc::new(|_| {})
}

#[test]
fn naming_creates_nested_camera_and_date_directories() {
    let dir = tempfile::tempdir().unwrap();
    let rotator = Rotator::new(dir.path().to_path_buf(), "front-door", "mp4", noop_scheduler());

    let location = rotator.location_for_segment(0);
    let path = std::path::Path::new(&location);

    assert!(path.starts_with(dir.path().join("front-door")));
    assert!(path.exists() == false, "the segment file itself is not created by the callback");
    assert!(path.parent().unwrap().exists(), "the day directory must exist");
}

#[test]
fn preflight_validation_writes_and_removes_probe_file() {
    let dir = tempfile::tempdir().unwrap();
    let rotator = Rotator::new(dir.path().to_path_buf(), "cam1", "mkv", noop_scheduler());

    assert!(rotator.validate_preflight(0.0).is_ok());
    let today = chrono::Local::now().format("%Y%m%d").to_string();
    let day_dir = dir.path().join("cam1").join(&today);
    assert!(day_dir.exists(), "the dated directory must be created during pre-flight");
    let probe = day_dir.join(".nvr-probe");
    assert!(!probe.exists(), "probe file must be deleted after the check");
}

#[test]
fn corrupted_segment_policy_deletes_only_empty_files() {
    let dir = tempfile::tempdir().unwrap();
    let rotator = Rotator::new(dir.path().to_path_buf(), "cam1", "mp4", noop_scheduler());

    let zero_byte = dir.path().join("seg_zero.mp4");
    std::fs::write(&zero_byte, []).unwrap();
    rotator.cleanup_last_segment_if_empty(&zero_byte);
    assert!(!zero_byte.exists());

    let partial = dir.path().join("seg_partial.mp4");
    std::fs::write(&partial, b"ftypisommoov").unwrap();
    rotator.cleanup_last_segment_if_empty(&partial);
    assert!(partial.exists(), "non-zero truncated segments are retained");
}

#[test]
fn naming_failure_path_schedules_storage_disconnected_and_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let blocker_file = dir.path().join("blocked");
    std::fs::write(&blocker_file, b"not a directory").unwrap();

    let scheduled = Arc::new(std::sync::Mutex::new(None));
    let scheduled_clone = scheduled.clone();
    let scheduler: nvr_pipeline::rotator::FaultScheduler = Arc::new(move |kind| {
        *scheduled_clone.lock().unwrap() = Some(kind);
    });

    let rotator = Rotator::new(blocker_file.join("cam1"), "cam1", "mp4", scheduler);
    let location = rotator.location_for_segment(0);

    assert_eq!(*scheduled.lock().unwrap(), Some(FaultKind::StorageDisconnected));
    assert!(location.contains("nvr-pipeline-fallback"));
}
