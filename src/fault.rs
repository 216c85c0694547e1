//! Fault classifier & handler.
//!
//! [`classify`] turns a bus error record into a [`FaultKind`] using a
//! three-tier rule set. It is pure — no pipeline or timer side effects — so
//! it can be driven directly from tests without a running `gst::Pipeline`.
//! The per-fault *handlers* that mutate engine state live in
//! `engine::CameraEngine::handle_fault`, which dispatches on the returned
//! `FaultKind`.

use serde::{Deserialize, Serialize};

/// Typed fault classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    RtspNetwork,
    StorageDisconnected,
    DiskFull,
    Decoder,
    VideoSink,
    RecordingBranch,
    StreamingBranch,
    Unknown,
}

/// Coarse GStreamer error domain, decoupled from the `gstreamer` crate's own
/// error types so the classifier can be unit tested without initializing
/// GStreamer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    Resource,
    StateChange,
    Stream,
    Core,
    Library,
    Other,
}

/// Coarse error code, likewise decoupled from `gst::ResourceError` etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoSpaceLeft,
    OpenRead,
    OpenWrite,
    Read,
    Write,
    Failed,
    NotFound,
    Other,
}

/// A bus error record as consumed by the classifier.
#[derive(Debug, Clone)]
pub struct BusErrorRecord {
    pub source_element_name: String,
    pub domain: ErrorDomain,
    pub code: ErrorCode,
    pub message: String,
    pub debug: Option<String>,
}

fn is_sink_like(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.contains("sink") || name.contains("mux") || name.contains("filesink")
}

fn is_decoder_like(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.contains("dec")
}

/// Classify a bus error record into a [`FaultKind`] following a tiered rule
/// set. Tiers are tried in order; the first match wins.
pub fn classify(rec: &BusErrorRecord) -> FaultKind {
    let is_source = rec.source_element_name == "source";

    // Tier 1: domain + code.
    if rec.code == ErrorCode::NoSpaceLeft {
        return FaultKind::DiskFull;
    }
    if rec.domain == ErrorDomain::Resource {
        if is_source {
            return FaultKind::RtspNetwork;
        }
        if is_sink_like(&rec.source_element_name) {
            return FaultKind::StorageDisconnected;
        }
    }
    if rec.domain == ErrorDomain::StateChange && is_sink_like(&rec.source_element_name) {
        return FaultKind::StorageDisconnected;
    }

    // Tier 2: source-name + code.
    if is_source
        && matches!(
            rec.code,
            ErrorCode::Failed | ErrorCode::OpenRead | ErrorCode::OpenWrite | ErrorCode::Read | ErrorCode::Write
        )
    {
        return FaultKind::RtspNetwork;
    }
    if is_sink_like(&rec.source_element_name)
        && matches!(
            rec.code,
            ErrorCode::OpenWrite | ErrorCode::Write | ErrorCode::Failed
        )
    {
        return FaultKind::StorageDisconnected;
    }

    // Tier 3: message substring.
    let msg = rec.message.to_ascii_lowercase();
    if msg.contains("no space") {
        return FaultKind::DiskFull;
    }
    if msg.contains("decode") && is_decoder_like(&rec.source_element_name) {
        return FaultKind::Decoder;
    }
    if msg.contains("output window") {
        return FaultKind::VideoSink;
    }

    // An unclassified error from the source element is still most likely a
    // network problem, so it is treated as one rather than left unknown.
    if is_source {
        return FaultKind::RtspNetwork;
    }
    FaultKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(name: &str, domain: ErrorDomain, code: ErrorCode, message: &str) -> BusErrorRecord {
        BusErrorRecord {
            source_element_name: name.to_string(),
            domain,
            code,
            message: message.to_string(),
            debug: None,
        }
    }

    #[test]
    fn resource_error_on_source_is_rtsp_network() {
        let r = rec("source", ErrorDomain::Resource, ErrorCode::Read, "read failed");
        assert_eq!(classify(&r), FaultKind::RtspNetwork);
    }

    #[test]
    fn resource_error_on_sink_is_storage_disconnected() {
        let r = rec("filesink0", ErrorDomain::Resource, ErrorCode::Write, "write failed");
        assert_eq!(classify(&r), FaultKind::StorageDisconnected);
    }

    #[test]
    fn state_change_failure_on_muxer_is_storage_disconnected() {
        let r = rec("mp4mux0", ErrorDomain::StateChange, ErrorCode::Failed, "state change failed");
        assert_eq!(classify(&r), FaultKind::StorageDisconnected);
    }

    #[test]
    fn no_space_code_is_disk_full_regardless_of_source() {
        let r = rec("splitmuxsink0", ErrorDomain::Resource, ErrorCode::NoSpaceLeft, "disk full");
        assert_eq!(classify(&r), FaultKind::DiskFull);
    }

    #[test]
    fn source_name_with_stream_error_code_is_rtsp_network() {
        let r = rec("source", ErrorDomain::Stream, ErrorCode::Failed, "internal stream error");
        assert_eq!(classify(&r), FaultKind::RtspNetwork);
    }

    #[test]
    fn no_space_substring_is_disk_full() {
        let r = rec("queue2_0", ErrorDomain::Other, ErrorCode::Other, "No space left on device");
        assert_eq!(classify(&r), FaultKind::DiskFull);
    }

    #[test]
    fn decode_substring_on_decoder_element_is_decoder_fault() {
        let r = rec("v4l2h264dec0", ErrorDomain::Other, ErrorCode::Other, "failed to decode frame");
        assert_eq!(classify(&r), FaultKind::Decoder);
    }

    #[test]
    fn output_window_substring_is_video_sink() {
        let r = rec("autovideosink0", ErrorDomain::Other, ErrorCode::Other, "could not create output window");
        assert_eq!(classify(&r), FaultKind::VideoSink);
    }

    #[test]
    fn unrelated_element_falls_back_to_unknown() {
        let r = rec("identity0", ErrorDomain::Other, ErrorCode::Other, "something odd happened");
        assert_eq!(classify(&r), FaultKind::Unknown);
    }

    #[test]
    fn unknown_from_source_is_treated_as_rtsp_network() {
        let r = rec("source", ErrorDomain::Other, ErrorCode::Other, "mystifying failure");
        assert_eq!(classify(&r), FaultKind::RtspNetwork);
    }
}
