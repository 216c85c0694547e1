//! Event / callback bus.
//!
//! Two independent observer lists — connection-state and recording-state —
//! fan out `(camera_id, bool)` transitions. Dispatch is synchronous, on
//! whatever thread calls `publish_*` (the media event loop thread).
//! Observers must be fast and non-blocking; the bus does not enforce that,
//! it only documents it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

/// A connection-state observer: `(camera_id, connected)`.
pub type ConnectionObserver = Box<dyn Fn(&str, bool) + Send + Sync>;
/// A recording-state observer: `(camera_id, recording)`.
pub type RecordingObserver = Box<dyn Fn(&str, bool) + Send + Sync>;

/// Handle returned from registration; required for explicit unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

struct Entry<T> {
    id: u64,
    callback: T,
}

/// Per-camera event bus. One instance is owned by each `CameraEngine`.
pub struct EventBus {
    camera_id: String,
    next_id: AtomicU64,
    connection_observers: Mutex<Vec<Entry<ConnectionObserver>>>,
    recording_observers: Mutex<Vec<Entry<RecordingObserver>>>,
    last_connected: Mutex<Option<bool>>,
    last_recording: Mutex<Option<bool>>,
    dispatching: AtomicBool,
}

impl EventBus {
    pub fn new(camera_id: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            next_id: AtomicU64::new(1),
            connection_observers: Mutex::new(Vec::new()),
            recording_observers: Mutex::new(Vec::new()),
            last_connected: Mutex::new(None),
            last_recording: Mutex::new(None),
            dispatching: AtomicBool::new(false),
        }
    }

    pub fn register_connection_observer(&self, callback: ConnectionObserver) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.connection_observers.lock().push(Entry { id, callback });
        ObserverId(id)
    }

    pub fn unregister_connection_observer(&self, id: ObserverId) {
        self.connection_observers.lock().retain(|e| e.id != id.0);
    }

    pub fn register_recording_observer(&self, callback: RecordingObserver) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.recording_observers.lock().push(Entry { id, callback });
        ObserverId(id)
    }

    pub fn unregister_recording_observer(&self, id: ObserverId) {
        self.recording_observers.lock().retain(|e| e.id != id.0);
    }

    /// Publish a connection-state transition. Suppressed if `connected`
    /// equals the last published value, so observers never see a duplicate.
    pub fn publish_connected(&self, connected: bool) {
        {
            let mut last = self.last_connected.lock();
            if *last == Some(connected) {
                return;
            }
            *last = Some(connected);
        }
        self.dispatch_connection(connected);
    }

    /// Publish a recording-state transition. Suppressed if `recording`
    /// equals the last published value.
    pub fn publish_recording(&self, recording: bool) {
        {
            let mut last = self.last_recording.lock();
            if *last == Some(recording) {
                return;
            }
            *last = Some(recording);
        }
        self.dispatch_recording(recording);
    }

    fn dispatch_connection(&self, connected: bool) {
        if self.dispatching.swap(true, Ordering::SeqCst) {
            warn!(
                camera = self.camera_id,
                "re-entrant publish during connection-state dispatch suppressed"
            );
            return;
        }
        for entry in self.connection_observers.lock().iter() {
            (entry.callback)(&self.camera_id, connected);
        }
        self.dispatching.store(false, Ordering::SeqCst);
    }

    fn dispatch_recording(&self, recording: bool) {
        if self.dispatching.swap(true, Ordering::SeqCst) {
            warn!(
                camera = self.camera_id,
                "re-entrant publish during recording-state dispatch suppressed"
            );
            return;
        }
        for entry in self.recording_observers.lock().iter() {
            (entry.callback)(&self.camera_id, recording);
        }
        self.dispatching.store(false, Ordering::SeqCst);
    }

    /// Remove every registered observer. Called on camera destroy.
    pub fn clear(&self) {
        self.connection_observers.lock().clear();
        self.recording_observers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn duplicate_transitions_are_suppressed() {
        let bus = EventBus::new("cam1");
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = calls.clone();
        bus.register_connection_observer(Box::new(move |id, connected| {
            calls_clone.lock().push((id.to_string(), connected));
        }));

        bus.publish_connected(true);
        bus.publish_connected(true);
        bus.publish_connected(false);
        bus.publish_connected(false);
        bus.publish_connected(true);

        let seen = calls.lock();
        assert_eq!(
            *seen,
            vec![
                ("cam1".to_string(), true),
                ("cam1".to_string(), false),
                ("cam1".to_string(), true),
            ]
        );
    }

    #[test]
    fn unregister_stops_future_dispatch() {
        let bus = EventBus::new("cam1");
        let calls = Arc::new(Mutex::new(0usize));
        let calls_clone = calls.clone();
        let id = bus.register_recording_observer(Box::new(move |_, _| {
            *calls_clone.lock() += 1;
        }));

        bus.publish_recording(true);
        assert_eq!(*calls.lock(), 1);

        bus.unregister_recording_observer(id);
        bus.publish_recording(false);
        assert_eq!(*calls.lock(), 1, "unregistered observer must not be called again");
    }

    #[test]
    fn clear_removes_all_observers() {
        let bus = EventBus::new("cam1");
        let calls = Arc::new(Mutex::new(0usize));
        let calls_clone = calls.clone();
        bus.register_connection_observer(Box::new(move |_, _| {
            *calls_clone.lock() += 1;
        }));
        bus.clear();
        bus.publish_connected(true);
        assert_eq!(*calls.lock(), 0);
    }

    #[test]
    fn independent_connection_and_recording_streams() {
        let bus = EventBus::new("cam1");
        let conn_calls = Arc::new(Mutex::new(0usize));
        let rec_calls = Arc::new(Mutex::new(0usize));
        let c1 = conn_calls.clone();
        let c2 = rec_calls.clone();
        bus.register_connection_observer(Box::new(move |_, _| *c1.lock() += 1));
        bus.register_recording_observer(Box::new(move |_, _| *c2.lock() += 1));

        bus.publish_connected(true);
        assert_eq!(*conn_calls.lock(), 1);
        assert_eq!(*rec_calls.lock(), 0);

        bus.publish_recording(true);
        assert_eq!(*conn_calls.lock(), 1);
        assert_eq!(*rec_calls.lock(), 1);
    }
}
