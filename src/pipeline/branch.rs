//! Branch controller.
//!
//! Opens and closes the streaming and recording branches by toggling each
//! valve's `drop` property. Never touches pipeline state — closing a valve
//! must not take the graph out of PLAYING.

use gstreamer::prelude::*;
use gstreamer::Element;
use parking_lot::Mutex;

use super::PipelineMode;
use crate::error::{NvrError, Result};

/// Thread-safe wrapper around the two valves. Cloning a `gstreamer::Element`
/// is cheap (it is a GObject reference), so `BranchController` can be shared
/// across threads via `Arc` without wrapping the valves themselves in a lock;
/// the only mutable state it owns is whether the recording branch currently
/// has a valid output path.
pub struct BranchController {
    streaming_valve: Element,
    recording_valve: Element,
    recording_path_ready: Mutex<bool>,
}

impl BranchController {
    pub fn new(streaming_valve: Element, recording_valve: Element) -> Self {
        Self {
            streaming_valve,
            recording_valve,
            recording_path_ready: Mutex::new(false),
        }
    }

    /// Called by the rotator once pre-flight path validation succeeds or
    /// fails, gating `open_recording`.
    pub fn set_recording_path_ready(&self, ready: bool) {
        *self.recording_path_ready.lock() = ready;
    }

    pub fn open_streaming(&self) {
        self.streaming_valve.set_property("drop", false);
    }

    pub fn close_streaming(&self) {
        self.streaming_valve.set_property("drop", true);
    }

    /// Opens the recording valve. Fails without touching the valve if the
    /// recording branch has no validated output path.
    pub fn open_recording(&self) -> Result<()> {
        if !*self.recording_path_ready.lock() {
            return Err(NvrError::InvalidState(
                "recording path not validated; refusing to open recording valve".into(),
            ));
        }
        self.recording_valve.set_property("drop", false);
        Ok(())
    }

    pub fn close_recording(&self) {
        self.recording_valve.set_property("drop", true);
    }

    pub fn current_mode(&self) -> PipelineMode {
        let streaming_open = !self.streaming_valve.property::<bool>("drop");
        let recording_open = !self.recording_valve.property::<bool>("drop");
        PipelineMode::from_valve_states(streaming_open, recording_open)
    }

    /// Drive the valves to match `mode` directly (used by `set_mode`).
    /// Recording cannot be opened this way if the path is not yet
    /// validated — callers should check the return value.
    pub fn apply_mode(&self, mode: PipelineMode) -> Result<()> {
        match mode {
            PipelineMode::StreamingOnly => {
                self.open_streaming();
                self.close_recording();
            }
            PipelineMode::RecordingOnly => {
                self.close_streaming();
                self.open_recording()?;
            }
            PipelineMode::Both => {
                self.open_streaming();
                self.open_recording()?;
            }
            PipelineMode::Neither => {
                self.close_streaming();
                self.close_recording();
            }
        }
        Ok(())
    }
}
