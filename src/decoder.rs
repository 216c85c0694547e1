//! Decoder and sink selection utilities.
//!
//! Pure element-selection helpers, callable during graph construction with
//! no side effects on a running pipeline. `gstreamer::ElementFactory::find`
//! is used to probe availability rather than attempting `make(...).build()`
//! and discarding the element.

use gstreamer::ElementFactory;
use tracing::warn;

use crate::error::{NvrError, Result};

/// Result of a decoder probe: the chosen factory name and whether it is
/// hardware-backed (anything outside the `avdec_*` software family).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderChoice {
    pub factory_name: String,
    pub hardware_backed: bool,
}

/// Probe `preference` in order and return the first available decoder
/// element. Fails if none of the named factories exist on this host.
pub fn probe_decoder(preference: &[String]) -> Result<DecoderChoice> {
    for name in preference {
        if ElementFactory::find(name).is_some() {
            return Ok(DecoderChoice {
                factory_name: name.clone(),
                hardware_backed: !name.starts_with("avdec_"),
            });
        }
    }
    Err(NvrError::GStreamer(format!(
        "no available decoder among preference list: {preference:?}"
    )))
}

/// Platform-ordered fallback chain for the streaming video sink.
const VIDEO_SINK_FALLBACK: &[&str] = &["glimagesink", "xvimagesink", "ximagesink", "autovideosink"];

/// Probe for an available video sink, returning the chosen factory name.
pub fn probe_video_sink() -> Result<String> {
    for name in VIDEO_SINK_FALLBACK {
        if ElementFactory::find(name).is_some() {
            return Ok((*name).to_string());
        }
    }
    Err(NvrError::GStreamer(
        "no available video sink in fallback chain".into(),
    ))
}

/// Attach an opaque native window handle to a sink element built by
/// [`probe_video_sink`]. Called after the graph reaches at least READY, per
/// the `gstreamer-video` `VideoOverlayExtManual` convention.
pub fn set_window_handle(sink: &gstreamer::Element, handle: usize) -> Result<()> {
    use gstreamer_video::prelude::VideoOverlayExtManual;
    let overlay = sink
        .dynamic_cast_ref::<gstreamer_video::VideoOverlay>()
        .ok_or_else(|| NvrError::GStreamer("sink does not implement VideoOverlay".into()))?;
    unsafe {
        overlay.set_window_handle(handle);
    }
    Ok(())
}

/// Whether the colorimetry shim (§4.1) should be inserted between parse and
/// decode on the streaming branch. Legacy hardware H.264 decoders reject
/// negotiated colorimetry unless forced to `bt709`; this is detected by
/// factory name rather than a runtime capability query, since the affected
/// decoders are a known, fixed set.
pub fn needs_colorimetry_shim(decoder_factory_name: &str) -> bool {
    matches!(decoder_factory_name, "v4l2h264dec" | "omxh264dec")
}

/// Build the colorimetry-forcing filter element (a capsfilter forcing
/// `video/x-raw,colorimetry=bt709`), or `None` with a warning if the
/// `capsfilter` factory is unavailable on this host.
pub fn make_colorimetry_shim() -> Option<gstreamer::Element> {
    match ElementFactory::make("capsfilter")
        .property(
            "caps",
            gstreamer::Caps::builder("video/x-raw")
                .field("colorimetry", "bt709")
                .build(),
        )
        .build()
    {
        Ok(elem) => Some(elem),
        Err(e) => {
            warn!(error = %e, "colorimetry shim unavailable, continuing without it");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        let _ = gstreamer::init();
    }

    #[test]
    fn probe_decoder_fails_when_nothing_on_preference_list_exists() {
        init();
        let prefs = vec!["definitely_not_a_real_decoder_xyz".to_string()];
        assert!(probe_decoder(&prefs).is_err());
    }

    #[test]
    fn needs_colorimetry_shim_is_true_only_for_known_legacy_decoders() {
        assert!(needs_colorimetry_shim("v4l2h264dec"));
        assert!(needs_colorimetry_shim("omxh264dec"));
        assert!(!needs_colorimetry_shim("avdec_h264"));
        assert!(!needs_colorimetry_shim("nvh264dec"));
    }
}
