//! Connection state machine.
//!
//! Owns only the *decision* logic: what state to move to, whether a
//! reconnect timer is already armed, what the next backoff delay is. Actual
//! graph rebuild / teardown and timer scheduling are driven by
//! `engine::CameraEngine`, which holds the tokio runtime handle and the
//! `PipelineGraph`; this module stays free of any GStreamer or tokio
//! dependency so the transition table and backoff sequence are unit
//! testable in isolation.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ReconnectConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Decision returned by the state machine's transition methods; the caller
/// (`CameraEngine`) is responsible for acting on it (building/tearing down
/// the graph, arming timers) — the machine itself never touches I/O.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    None,
    BuildGraphAndPlay,
    EmitConnected,
    ScheduleReconnect { delay_secs: u64 },
    AsyncStopAndScheduleReconnect { delay_secs: u64 },
    RebuildGraphAndPlay,
    EmitDisconnectedTerminal,
    StartRecordingAfterStabilization,
    CancelTimersAndNull,
}

/// `min(5 * 2^(n-1), ceiling)` for attempt `n >= 1`: `5, 10, 20, 30, 60, 60,
/// ...` for the default 60 s ceiling.
pub fn backoff_delay_secs(attempt: u32, ceiling_secs: u64) -> u64 {
    let attempt = attempt.max(1);
    let exp = 5u64.saturating_mul(1u64 << (attempt - 1).min(63));
    exp.min(ceiling_secs)
}

pub struct ConnectionMachine {
    camera_id: String,
    state: Mutex<ConnectionState>,
    retry_count: AtomicU32,
    reconnect_timer_armed: AtomicBool,
    auto_resume_recording: AtomicBool,
    config: ReconnectConfig,
}

impl ConnectionMachine {
    pub fn new(camera_id: impl Into<String>, config: ReconnectConfig) -> Self {
        Self {
            camera_id: camera_id.into(),
            state: Mutex::new(ConnectionState::Disconnected),
            retry_count: AtomicU32::new(0),
            reconnect_timer_armed: AtomicBool::new(false),
            auto_resume_recording: AtomicBool::new(false),
            config,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn auto_resume_recording(&self) -> bool {
        self.auto_resume_recording.load(Ordering::SeqCst)
    }

    pub fn set_auto_resume_recording(&self, value: bool) {
        self.auto_resume_recording.store(value, Ordering::SeqCst);
    }

    /// `DISCONNECTED --connect()--> CONNECTING`.
    pub fn connect(&self) -> Action {
        let mut state = self.state.lock();
        if *state != ConnectionState::Disconnected && *state != ConnectionState::Error {
            return Action::None;
        }
        *state = ConnectionState::Connecting;
        Action::BuildGraphAndPlay
    }

    /// `CONNECTING -- PLAYING confirmed, frames arriving --> CONNECTED`.
    pub fn on_playing_confirmed(&self) -> Action {
        let mut state = self.state.lock();
        if *state != ConnectionState::Connecting {
            return Action::None;
        }
        *state = ConnectionState::Connected;
        self.retry_count.store(0, Ordering::SeqCst);
        Action::EmitConnected
    }

    /// `CONNECTING -- error/frame-timeout --> RECONNECTING`, and
    /// `CONNECTED -- RTSP_NETWORK fault or watchdog timeout --> RECONNECTING`.
    pub fn on_connection_lost(&self) -> Action {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Connecting => {
                *state = ConnectionState::Reconnecting;
                drop(state);
                self.schedule_reconnect()
            }
            ConnectionState::Connected => {
                *state = ConnectionState::Reconnecting;
                drop(state);
                match self.schedule_reconnect() {
                    Action::ScheduleReconnect { delay_secs } => {
                        Action::AsyncStopAndScheduleReconnect { delay_secs }
                    }
                    other => other,
                }
            }
            _ => Action::None,
        }
    }

    fn schedule_reconnect(&self) -> Action {
        if self.reconnect_timer_armed.swap(true, Ordering::SeqCst) {
            // A timer is already armed; arming a second one would race it.
            return Action::None;
        }
        let attempt = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = backoff_delay_secs(attempt, self.config.backoff_ceiling_secs);
        info!(camera = self.camera_id, attempt, delay_secs = delay, "scheduling reconnect");
        Action::ScheduleReconnect { delay_secs: delay }
    }

    /// Called when the armed reconnect timer fires. Caller must disarm via
    /// [`ConnectionMachine::reconnect_timer_fired`] before the pre-flight probe.
    pub fn reconnect_timer_fired(&self) {
        self.reconnect_timer_armed.store(false, Ordering::SeqCst);
    }

    /// `RECONNECTING -- timer fires, pre-flight probe and restart succeed --> CONNECTED`.
    pub fn on_reconnect_success(&self) -> Action {
        let mut state = self.state.lock();
        if *state != ConnectionState::Reconnecting {
            return Action::None;
        }
        *state = ConnectionState::Connected;
        self.retry_count.store(0, Ordering::SeqCst);
        if self.auto_resume_recording.load(Ordering::SeqCst) {
            Action::StartRecordingAfterStabilization
        } else {
            Action::EmitConnected
        }
    }

    /// `RECONNECTING -- pre-flight probe fails, retries remain --> RECONNECTING`.
    /// `RECONNECTING -- retries exhausted --> ERROR`.
    pub fn on_reconnect_failure(&self) -> Action {
        let mut state = self.state.lock();
        if *state != ConnectionState::Reconnecting {
            return Action::None;
        }
        let attempts_so_far = self.retry_count.load(Ordering::SeqCst);
        let max = self.config.max_attempts;
        if max != 0 && attempts_so_far >= max {
            *state = ConnectionState::Error;
            warn!(camera = self.camera_id, attempts_so_far, "reconnect attempts exhausted");
            return Action::EmitDisconnectedTerminal;
        }
        drop(state);
        match self.schedule_reconnect() {
            Action::ScheduleReconnect { delay_secs } => Action::ScheduleReconnect { delay_secs },
            other => other,
        }
    }

    /// `any -- disconnect() --> DISCONNECTED`.
    pub fn disconnect(&self) -> Action {
        *self.state.lock() = ConnectionState::Disconnected;
        self.reconnect_timer_armed.store(false, Ordering::SeqCst);
        self.auto_resume_recording.store(false, Ordering::SeqCst);
        self.retry_count.store(0, Ordering::SeqCst);
        Action::CancelTimersAndNull
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ReconnectConfig {
        ReconnectConfig {
            backoff_ceiling_secs: 60,
            max_attempts: 10,
        }
    }

    #[test]
    fn backoff_sequence_matches_boundary_law() {
        assert_eq!(backoff_delay_secs(1, 60), 5);
        assert_eq!(backoff_delay_secs(2, 60), 10);
        assert_eq!(backoff_delay_secs(3, 60), 20);
        assert_eq!(backoff_delay_secs(4, 60), 40.min(60));
        assert_eq!(backoff_delay_secs(5, 60), 60);
        assert_eq!(backoff_delay_secs(6, 60), 60);
        assert_eq!(backoff_delay_secs(100, 60), 60);
    }

    #[test]
    fn connect_moves_disconnected_to_connecting() {
        let m = ConnectionMachine::new("cam1", cfg());
        assert_eq!(m.connect(), Action::BuildGraphAndPlay);
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn connect_is_noop_when_already_connecting() {
        let m = ConnectionMachine::new("cam1", cfg());
        m.connect();
        assert_eq!(m.connect(), Action::None);
    }

    #[test]
    fn full_happy_path_reaches_connected_and_resets_retry_count() {
        let m = ConnectionMachine::new("cam1", cfg());
        m.connect();
        assert_eq!(m.on_playing_confirmed(), Action::EmitConnected);
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn connection_lost_while_connected_schedules_async_stop_and_reconnect() {
        let m = ConnectionMachine::new("cam1", cfg());
        m.connect();
        m.on_playing_confirmed();
        let action = m.on_connection_lost();
        assert_eq!(action, Action::AsyncStopAndScheduleReconnect { delay_secs: 5 });
        assert_eq!(m.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn duplicate_reconnect_scheduling_is_forbidden() {
        let m = ConnectionMachine::new("cam1", cfg());
        m.connect();
        m.on_playing_confirmed();
        m.on_connection_lost();
        // Simulate another fault arriving before the timer fires/disarms.
        assert_eq!(m.on_connection_lost(), Action::None);
    }

    #[test]
    fn reconnect_success_with_auto_resume_starts_recording_after_stabilization() {
        let m = ConnectionMachine::new("cam1", cfg());
        m.connect();
        m.on_playing_confirmed();
        m.on_connection_lost();
        m.reconnect_timer_fired();
        m.set_auto_resume_recording(true);
        assert_eq!(m.on_reconnect_success(), Action::StartRecordingAfterStabilization);
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn reconnect_failure_exhausts_to_error_after_max_attempts() {
        let mut cfg = cfg();
        cfg.max_attempts = 2;
        let m = ConnectionMachine::new("cam1", cfg);
        m.connect();
        m.on_playing_confirmed();
        m.on_connection_lost(); // attempt 1 scheduled
        m.reconnect_timer_fired();
        assert_eq!(m.on_reconnect_failure(), Action::ScheduleReconnect { delay_secs: 10 }); // attempt 2
        m.reconnect_timer_fired();
        assert_eq!(m.on_reconnect_failure(), Action::EmitDisconnectedTerminal);
        assert_eq!(m.state(), ConnectionState::Error);
    }

    #[test]
    fn disconnect_clears_auto_resume_and_returns_to_disconnected_from_any_state() {
        let m = ConnectionMachine::new("cam1", cfg());
        m.connect();
        m.on_playing_confirmed();
        m.set_auto_resume_recording(true);
        assert_eq!(m.disconnect(), Action::CancelTimersAndNull);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(!m.auto_resume_recording());
    }
}
