//! Per-camera orchestrator.
//!
//! `CameraEngine` is the single owner of one camera's `PipelineGraph`,
//! `ConnectionMachine`, `Rotator`, `EventBus`, and timer tasks. It is the
//! only module that touches GStreamer state transitions directly; every
//! other module (fault, connection, events) is pure decision logic that
//! `CameraEngine` drives.
//!
//! The media event loop is a dedicated OS thread that reads the pipeline
//! bus (`Bus::iter_timed`). Bus errors are classified and handed to
//! `handle_fault`, which never runs on the bus thread itself — every fault
//! handler that does real work (stop-and-reconnect, recording retry,
//! watchdog) is posted to a tokio task, so the bus thread is never blocked.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gstreamer::prelude::*;
use gstreamer::MessageView;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{CameraConfig, StorageConfig};
use crate::connection::{Action, ConnectionMachine, ConnectionState};
use crate::decoder;
use crate::error::{NvrError, Result};
use crate::events::EventBus;
use crate::fault::{self, BusErrorRecord, ErrorCode, ErrorDomain, FaultKind};
use crate::pipeline::{BranchController, PipelineGraph, PipelineMode};
use crate::rotator::Rotator;

/// Timer handles kept so `disconnect()` can cancel all of them in one place.
#[derive(Default)]
struct Timers {
    reconnect: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    recording_retry: Option<JoinHandle<()>>,
}

impl Timers {
    fn cancel_all(&mut self) {
        for h in [self.reconnect.take(), self.watchdog.take(), self.recording_retry.take()]
            .into_iter()
            .flatten()
        {
            h.abort();
        }
    }
}

pub struct CameraEngine {
    camera: CameraConfig,
    storage: StorageConfig,
    global_decoder_preference: Vec<String>,
    events: EventBus,
    connection: ConnectionMachine,
    rotator: Rotator,
    graph: Mutex<Option<PipelineGraph>>,
    branch: Mutex<Option<BranchController>>,
    bus_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    timers: Mutex<Timers>,
    last_frame_at_ms: Arc<AtomicI64>,
    last_segment_path: Mutex<Option<PathBuf>>,
    recording_active: std::sync::atomic::AtomicBool,
}

impl CameraEngine {
    pub fn new(
        camera: CameraConfig,
        storage: StorageConfig,
        global_decoder_preference: &[String],
    ) -> Arc<Self> {
        let events = EventBus::new(camera.id.clone());
        let connection = ConnectionMachine::new(camera.id.clone(), camera.reconnect);

        // The naming callback fires from the media event loop thread, before
        // an `Arc<CameraEngine>` necessarily exists yet (it is being built
        // right now). `self_ref` is filled in immediately below once the
        // `Arc` is constructed, so the closure can dispatch through
        // `handle_fault` on a tokio task rather than ever blocking the
        // caller.
        let self_ref: Arc<Mutex<Option<std::sync::Weak<CameraEngine>>>> = Arc::new(Mutex::new(None));
        let fault_scheduler: crate::rotator::FaultScheduler = {
            let self_ref = self_ref.clone();
            Arc::new(move |kind| {
                if let Some(engine) = self_ref.lock().as_ref().and_then(|w| w.upgrade()) {
                    tokio::spawn(async move { engine.handle_fault(kind).await });
                }
            })
        };
        let rotator = Rotator::new(
            storage.root.clone(),
            camera.id.clone(),
            storage.container_format.extension(),
            fault_scheduler,
        );

        let engine = Arc::new(Self {
            camera,
            storage,
            global_decoder_preference: global_decoder_preference.to_vec(),
            events,
            connection,
            rotator,
            graph: Mutex::new(None),
            branch: Mutex::new(None),
            bus_thread: Mutex::new(None),
            timers: Mutex::new(Timers::default()),
            last_frame_at_ms: Arc::new(AtomicI64::new(0)),
            last_segment_path: Mutex::new(None),
            recording_active: std::sync::atomic::AtomicBool::new(false),
        });
        *self_ref.lock() = Some(Arc::downgrade(&engine));
        engine
    }

    pub fn id(&self) -> &str {
        &self.camera.id
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Connects the camera: builds the pipeline graph and starts it. If the
    /// initial build fails, the connection machine is moved into the same
    /// reconnect path a later connection loss would take, rather than left
    /// stuck in `Connecting` forever.
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        match self.connection.connect() {
            Action::BuildGraphAndPlay => {
                if let Err(e) = self.build_and_play() {
                    error!(camera = self.id(), error = %e, "initial connect failed, scheduling reconnect");
                    if let Action::ScheduleReconnect { delay_secs } = self.connection.on_connection_lost() {
                        let engine = self.clone();
                        tokio::spawn(async move { engine.run_reconnect_after_delay(delay_secs).await });
                    }
                    return Err(NvrError::CameraConnection { id: self.id().to_string(), reason: e.to_string() });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Disconnects the camera: cancels all timers, nulls the pipeline,
    /// clears auto-resume, and removes every registered observer.
    pub fn disconnect(self: &Arc<Self>) {
        self.connection.disconnect();
        self.timers.lock().cancel_all();
        if let Some(graph) = self.graph.lock().take() {
            let _ = graph.pipeline.set_state(gstreamer::State::Null);
        }
        self.branch.lock().take();
        if let Some(handle) = self.bus_thread.lock().take() {
            let _ = handle.join();
        }
        self.recording_active.store(false, Ordering::SeqCst);
        self.events.publish_connected(false);
        self.events.publish_recording(false);
        self.events.clear();
    }

    fn build_and_play(self: &Arc<Self>) -> Result<()> {
        let decoder_prefs = self
            .camera
            .decoder_preference
            .clone()
            .unwrap_or_else(|| self.global_decoder_preference.clone());
        let decoder_choice = decoder::probe_decoder(&decoder_prefs)?;
        let video_sink_factory = decoder::probe_video_sink()?;

        let rotation_minutes = self.camera.rotation_minutes.unwrap_or(self.storage.rotation_minutes);

        let engine_weak = Arc::downgrade(self);
        let segment_cb = move |fragment_id: u32| -> String {
            if let Some(engine) = engine_weak.upgrade() {
                let location = engine.rotator.location_for_segment(fragment_id);
                *engine.last_segment_path.lock() = Some(PathBuf::from(&location));
                location
            } else {
                format!("/tmp/orphaned_segment_{fragment_id}.mp4")
            }
        };

        let graph = PipelineGraph::build(
            &self.camera,
            &decoder_choice,
            &video_sink_factory,
            self.storage.container_format.muxer_factory_name(),
            rotation_minutes,
            segment_cb,
        )?;

        graph
            .pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| NvrError::GStreamer(format!("set_state Playing: {e}")))?;

        let branch = BranchController::new(graph.streaming_valve.clone(), graph.recording_valve.clone());
        self.install_watchdog_probe(&graph);

        let bus = graph.pipeline.bus().ok_or_else(|| NvrError::GStreamer("pipeline has no bus".into()))?;
        let pipeline_element: gstreamer::Element = graph.pipeline.clone().upcast();

        *self.graph.lock() = Some(graph);
        *self.branch.lock() = Some(branch);

        let engine_for_bus = self.clone();
        let bus_handle = std::thread::spawn(move || {
            for msg in bus.iter_timed(gstreamer::ClockTime::NONE) {
                match msg.view() {
                    MessageView::Error(err) => {
                        let rec = map_bus_error(&err);
                        let kind = fault::classify(&rec);
                        info!(camera = engine_for_bus.id(), ?kind, "bus error classified");
                        let engine = engine_for_bus.clone();
                        tokio::spawn(async move { engine.handle_fault(kind).await });
                    }
                    MessageView::Eos(..) => {
                        let engine = engine_for_bus.clone();
                        tokio::spawn(async move { engine.handle_fault(FaultKind::RtspNetwork).await });
                        break;
                    }
                    MessageView::StateChanged(sc) => {
                        if sc.src().map(|s| s == pipeline_element.upcast_ref::<gstreamer::Object>()).unwrap_or(false)
                            && sc.current() == gstreamer::State::Playing
                        {
                            let engine = engine_for_bus.clone();
                            tokio::spawn(async move { engine.on_playing().await });
                        }
                    }
                    _ => {}
                }
            }
        });

        *self.bus_thread.lock() = Some(bus_handle);

        self.spawn_watchdog_timer();

        if self.camera.recording_on_start {
            self.connection.set_auto_resume_recording(true);
        }

        Ok(())
    }

    async fn on_playing(self: Arc<Self>) {
        self.last_frame_at_ms.store(now_ms(), Ordering::SeqCst);
        match self.connection.on_playing_confirmed() {
            Action::EmitConnected => self.events.publish_connected(true),
            _ => {}
        }
        if self.connection.state() == ConnectionState::Connected && self.camera.recording_on_start {
            self.start_recording_after_stabilization().await;
        }
    }

    fn install_watchdog_probe(self: &Arc<Self>, graph: &PipelineGraph) {
        let last_frame = self.last_frame_at_ms.clone();
        if let Some(pad) = graph.decoder_src_pad_element.static_pad("src") {
            pad.add_probe(gstreamer::PadProbeType::BUFFER, move |_, _| {
                last_frame.store(now_ms(), Ordering::SeqCst);
                gstreamer::PadProbeReturn::Ok
            });
        }
    }

    fn spawn_watchdog_timer(self: &Arc<Self>) {
        let engine = self.clone();
        let interval = Duration::from_secs(self.camera.watchdog.check_interval_secs);
        let timeout_ms = (self.camera.watchdog.timeout_secs * 1000) as i64;
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if engine.connection.state() != ConnectionState::Connected {
                    continue;
                }
                let delta = now_ms() - engine.last_frame_at_ms.load(Ordering::SeqCst);
                if delta >= timeout_ms {
                    warn!(camera = engine.id(), delta_ms = delta, "frame-flow watchdog timed out");
                    engine.handle_fault(FaultKind::RtspNetwork).await;
                }
            }
        });
        self.timers.lock().watchdog = Some(handle);
    }

    /// Per-fault handler dispatch.
    pub async fn handle_fault(self: &Arc<Self>, kind: FaultKind) {
        match kind {
            FaultKind::RtspNetwork => self.on_rtsp_network_fault().await,
            FaultKind::StorageDisconnected => self.on_storage_disconnected().await,
            FaultKind::DiskFull => self.on_disk_full().await,
            FaultKind::Decoder => {
                warn!(camera = self.id(), "decoder fault, attempting best-effort recovery");
            }
            FaultKind::VideoSink => {
                if let Some(branch) = self.branch.lock().as_ref() {
                    branch.close_streaming();
                }
                warn!(camera = self.id(), "video sink fault, streaming branch closed");
            }
            FaultKind::RecordingBranch | FaultKind::StreamingBranch | FaultKind::Unknown => {
                warn!(camera = self.id(), ?kind, "unclassified or branch fault logged, no action taken");
            }
        }
    }

    async fn on_rtsp_network_fault(self: &Arc<Self>) {
        let was_recording = self.recording_active.load(Ordering::SeqCst);
        if was_recording {
            self.connection.set_auto_resume_recording(true);
        }
        match self.connection.on_connection_lost() {
            Action::AsyncStopAndScheduleReconnect { delay_secs } => {
                self.run_stop_and_reconnect(delay_secs).await;
            }
            Action::ScheduleReconnect { delay_secs } => {
                self.run_reconnect_after_delay(delay_secs).await;
            }
            _ => {}
        }
    }

    async fn on_storage_disconnected(self: &Arc<Self>) {
        self.stop_recording(true);
        self.connection.set_auto_resume_recording(true);
        self.spawn_recording_retry_timer();
    }

    async fn on_disk_full(self: &Arc<Self>) {
        self.stop_recording(false);
        let deleted = crate::storage::auto_cleanup(
            &self.storage.root,
            self.storage.cleanup_max_age_days,
            self.storage.cleanup_min_free_target_gb,
        )
        .unwrap_or(0);
        info!(camera = self.id(), deleted, "disk-full cleanup ran");
        let free = crate::storage::free_space_gb(&self.storage.root).unwrap_or(0.0);
        if free >= self.storage.cleanup_min_free_target_gb {
            self.connection.set_auto_resume_recording(true);
            self.spawn_recording_retry_timer();
        } else {
            error!(camera = self.id(), free_gb = free, "disk full and cleanup insufficient, recording disabled");
            self.events.publish_recording(false);
        }
    }

    async fn run_stop_and_reconnect(self: &Arc<Self>, delay_secs: u64) {
        if let Some(graph) = self.graph.lock().take() {
            let _ = graph.pipeline.set_state(gstreamer::State::Null);
        }
        self.branch.lock().take();
        self.events.publish_connected(false);
        self.run_reconnect_after_delay(delay_secs).await;
    }

    async fn run_reconnect_after_delay(self: &Arc<Self>, delay_secs: u64) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            engine.connection.reconnect_timer_fired();
            if engine.connection.state() != ConnectionState::Reconnecting {
                return;
            }
            match engine.preflight_probe().await {
                true => match engine.build_and_play() {
                    Ok(()) => {
                        let action = engine.connection.on_reconnect_success();
                        if !matches!(action, Action::None) {
                            engine.apply_reconnect_success(action).await;
                        }
                    }
                    Err(e) => {
                        error!(camera = engine.id(), error = %e, "graph rebuild failed on reconnect");
                        if let Action::ScheduleReconnect { delay_secs } = engine.connection.on_reconnect_failure() {
                            engine.run_reconnect_after_delay_boxed(delay_secs).await;
                        }
                    }
                },
                false => {
                    let action = engine.connection.on_reconnect_failure();
                    if let Action::ScheduleReconnect { delay_secs } = action {
                        engine.run_reconnect_after_delay_boxed(delay_secs).await;
                    } else if let Action::EmitDisconnectedTerminal = action {
                        engine.events.publish_connected(false);
                    }
                }
            }
        });
        self.timers.lock().reconnect = Some(handle);
    }

    /// Applies the result of a successful reconnect: publishes
    /// `connected(true)` first, then starts the recording retry loop if the
    /// camera was recording before the connection dropped. Connected must
    /// always be observed before recording on the same cycle.
    async fn apply_reconnect_success(self: &Arc<Self>, action: Action) {
        self.events.publish_connected(true);
        if let Action::StartRecordingAfterStabilization = action {
            self.start_recording_after_stabilization().await;
        }
    }

    fn run_reconnect_after_delay_boxed(
        self: &Arc<Self>,
        delay_secs: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.run_reconnect_after_delay(delay_secs))
    }

    /// Pre-flight RTSP probe: a minimal `rtspsrc -> fakesink` graph driven
    /// to READY, which triggers the RTSP DESCRIBE round-trip, then torn
    /// down. Cheap success/fail signal before a full rebuild.
    async fn preflight_probe(self: &Arc<Self>) -> bool {
        let url = self.camera.url.clone();
        tokio::task::spawn_blocking(move || {
            let pipeline = match gstreamer::parse::launch(&format!(
                "rtspsrc name=probe-source location={url} protocols=tcp ! fakesink"
            )) {
                Ok(p) => p,
                Err(_) => return false,
            };
            let ok = pipeline.set_state(gstreamer::State::Ready).is_ok();
            std::thread::sleep(Duration::from_millis(500));
            let _ = pipeline.set_state(gstreamer::State::Null);
            ok
        })
        .await
        .unwrap_or(false)
    }

    async fn start_recording_after_stabilization(self: &Arc<Self>) {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if !self.start_recording() {
            self.spawn_recording_retry_timer();
        }
    }

    /// Validates the recording path and opens the recording valve. Never
    /// touches the valve if pre-flight validation fails.
    pub fn start_recording(&self) -> bool {
        if let Some(last) = self.last_segment_path.lock().clone() {
            self.rotator.cleanup_last_segment_if_empty(&last);
        }
        if self.rotator.validate_preflight(self.storage.min_free_gb).is_err() {
            return false;
        }
        let branch_guard = self.branch.lock();
        let Some(branch) = branch_guard.as_ref() else {
            return false;
        };
        branch.set_recording_path_ready(true);
        match branch.open_recording() {
            Ok(()) => {
                self.recording_active.store(true, Ordering::SeqCst);
                self.events.publish_recording(true);
                true
            }
            Err(e) => {
                warn!(camera = &self.camera.id, error = %e, "start_recording failed");
                false
            }
        }
    }

    /// Closes the recording valve. `storage_error` suppresses the segmenter
    /// finalize, since a storage fault means the muxer has nowhere left to
    /// flush the final fragment.
    pub fn stop_recording(&self, storage_error: bool) {
        if let Some(branch) = self.branch.lock().as_ref() {
            branch.close_recording();
        }
        if !storage_error {
            if let Some(graph) = self.graph.lock().as_ref() {
                graph.splitmuxsink.emit_by_name::<()>("split-now", &[]);
            }
        }
        self.recording_active.store(false, Ordering::SeqCst);
        self.events.publish_recording(false);
    }

    fn spawn_recording_retry_timer(self: &Arc<Self>) {
        let engine = self.clone();
        let interval = Duration::from_secs(self.camera.recording_retry.interval_secs);
        let max_attempts = self.camera.recording_retry.max_attempts;
        let handle = tokio::spawn(async move {
            let mut attempts = 0u32;
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                attempts += 1;
                if engine.start_recording() {
                    engine.connection.set_auto_resume_recording(false);
                    return;
                }
                if attempts >= max_attempts {
                    error!(camera = engine.id(), attempts, "recording retry exhausted, recording disabled");
                    engine.events.publish_recording(false);
                    return;
                }
            }
        });
        self.timers.lock().recording_retry = Some(handle);
    }

    /// Drives the pipeline to `mode` by toggling valves only; never
    /// rebuilds the graph.
    pub fn set_mode(&self, mode: PipelineMode) -> Result<()> {
        let branch = self.branch.lock();
        let branch = branch
            .as_ref()
            .ok_or_else(|| NvrError::InvalidState("not connected".into()))?;
        branch.apply_mode(mode)
    }
}

fn now_ms() -> i64 {
    // `std::time::Instant` has no epoch, so use a monotonic counter seeded
    // from the last observed tick rather than wall-clock time; this keeps
    // the watchdog delta computation free of `SystemTime` drift issues.
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(std::time::Instant::now);
    start.elapsed().as_millis() as i64
}

/// Translate a GStreamer bus error message into the classifier's
/// domain-independent [`BusErrorRecord`].
fn map_bus_error(err: &gstreamer::message::Error) -> BusErrorRecord {
    let glib_err = err.error();
    let source_element_name = err
        .src()
        .map(|s| s.name().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let message = glib_err.to_string();

    let domain = if glib_err.is::<gstreamer::ResourceError>() {
        ErrorDomain::Resource
    } else if glib_err.is::<gstreamer::StreamError>() {
        ErrorDomain::Stream
    } else if glib_err.is::<gstreamer::CoreError>() {
        ErrorDomain::Core
    } else if glib_err.is::<gstreamer::LibraryError>() {
        ErrorDomain::Library
    } else {
        ErrorDomain::Other
    };

    let code = if let Some(e) = glib_err.kind::<gstreamer::ResourceError>() {
        match e {
            gstreamer::ResourceError::NoSpaceLeft => ErrorCode::NoSpaceLeft,
            gstreamer::ResourceError::OpenRead => ErrorCode::OpenRead,
            gstreamer::ResourceError::OpenWrite => ErrorCode::OpenWrite,
            gstreamer::ResourceError::Read => ErrorCode::Read,
            gstreamer::ResourceError::Write => ErrorCode::Write,
            gstreamer::ResourceError::NotFound => ErrorCode::NotFound,
            gstreamer::ResourceError::Failed => ErrorCode::Failed,
            _ => ErrorCode::Other,
        }
    } else {
        ErrorCode::Other
    };

    BusErrorRecord {
        source_element_name,
        domain,
        code,
        message,
        debug: err.debug(),
    }
}
