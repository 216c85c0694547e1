//! Pipeline graph builder.
//!
//! Topology:
//!
//! ```text
//! rtspsrc → depay/parse → tee
//!   ├─ stream-queue → streaming-valve → (colorimetry-shim) → decoder →
//!   │    videoconvert → videoscale → (videoflip) → (timeoverlay) → sink
//!   └─ record-queue  → recording-valve → parse → splitmuxsink
//! ```
//!
//! The tee and both valves always exist, even in single-mode operation, so
//! that `set_mode` never rebuilds the graph — only valve `drop` properties
//! change.

use gstreamer::prelude::*;
use gstreamer::{Element, ElementFactory, Pipeline};
use tracing::warn;

use crate::config::CameraConfig;
use crate::decoder::{self, DecoderChoice};
use crate::error::{NvrError, Result};

fn make(factory: &str, name: &str) -> Result<Element> {
    ElementFactory::make(factory).name(name).build().map_err(|e| {
        NvrError::GStreamer(format!("failed to create element '{factory}' ({name}): {e}"))
    })
}

/// Elements that make up the constructed graph, kept alive for the lifetime
/// of the pipeline so the branch controller and rotator can reach them.
pub struct PipelineGraph {
    pub pipeline: Pipeline,
    pub streaming_valve: Element,
    pub recording_valve: Element,
    pub splitmuxsink: Element,
    pub decoder_src_pad_element: Element,
    pub video_sink: Element,
}

/// Codec family to depay/parse for. H.264 is the only family wired here,
/// matching the only decoder preference list the default config ships.
fn build_depay_parse() -> Result<(Element, Element)> {
    Ok((make("rtph264depay", "depay")?, make("h264parse", "parse")?))
}

impl PipelineGraph {
    /// Build the full graph for `camera`. `decoder` is the already-probed
    /// decoder choice; `segment_location_cb` is invoked by `splitmuxsink`'s
    /// `format-location-full` signal to name each segment (wired up by the
    /// rotator).
    pub fn build(
        camera: &CameraConfig,
        decoder: &DecoderChoice,
        video_sink_factory: &str,
        container_muxer_factory: &str,
        rotation_minutes: u64,
        segment_location_cb: impl Fn(u32) -> String + Send + Sync + 'static,
    ) -> Result<Self> {
        let pipeline = Pipeline::builder().name(format!("cam-{}", camera.id)).build();

        let source = ElementFactory::make("rtspsrc")
            .name("source")
            .property("location", &camera.url)
            .property_from_str("protocols", "tcp")
            .property("tcp-timeout", camera.rtsp.tcp_timeout_ms * 1000)
            .property("latency", camera.rtsp.latency_ms)
            .property("retry", 5u32)
            .build()
            .map_err(|e| NvrError::GStreamer(format!("failed to create element 'rtspsrc' (source): {e}")))?;

        let (depay, parse) = build_depay_parse()?;
        let tee = make("tee", "tee")?;

        // Streaming branch.
        let stream_queue = ElementFactory::make("queue")
            .name("stream-queue")
            .property("max-size-buffers", 200u32)
            .property("max-size-bytes", 10 * 1024 * 1024u32)
            .property("max-size-time", 2u64 * gstreamer::ClockTime::SECOND.nseconds())
            .property_from_str("leaky", "downstream")
            .build()
            .map_err(|e| NvrError::GStreamer(format!("failed to create element 'queue' (stream-queue): {e}")))?;
        let streaming_valve = ElementFactory::make("valve")
            .name("streaming-valve")
            .property("drop", true)
            .build()
            .map_err(|e| NvrError::GStreamer(format!("failed to create element 'valve' (streaming-valve): {e}")))?;

        let colorimetry_shim = if decoder::needs_colorimetry_shim(&decoder.factory_name) {
            decoder::make_colorimetry_shim()
        } else {
            None
        };

        let decode_element = make(&decoder.factory_name, "decoder")?;
        let convert = make("videoconvert", "convert")?;
        let scale = make("videoscale", "scale")?;

        let videoflip = build_videoflip(camera);

        let timeoverlay = build_timeoverlay(camera)?;

        let video_sink = make(video_sink_factory, "sink")?;
        video_sink.set_property("sync", false);

        // Recording branch.
        let record_queue = ElementFactory::make("queue")
            .name("record-queue")
            .property("max-size-buffers", 0u32)
            .property("max-size-bytes", 0u32)
            .property("max-size-time", 10u64 * gstreamer::ClockTime::SECOND.nseconds())
            .build()
            .map_err(|e| NvrError::GStreamer(format!("failed to create element 'queue' (record-queue): {e}")))?;
        let recording_valve = ElementFactory::make("valve")
            .name("recording-valve")
            .property("drop", true)
            .build()
            .map_err(|e| NvrError::GStreamer(format!("failed to create element 'valve' (recording-valve): {e}")))?;
        let record_parse = make("h264parse", "record-parse")?;

        let splitmuxsink = ElementFactory::make("splitmuxsink")
            .name("splitmuxsink")
            .property("max-size-time", rotation_minutes * 60 * gstreamer::ClockTime::SECOND.nseconds())
            .property("muxer-factory", container_muxer_factory)
            .property("use-robust-muxing", true)
            .property("async-finalize", true)
            .property("send-keyframe-requests", true)
            .property("alignment-threshold", 0u64)
            .build()
            .map_err(|e| NvrError::GStreamer(format!("failed to create element 'splitmuxsink' (splitmuxsink): {e}")))?;

        splitmuxsink.connect("format-location-full", false, move |args| {
            let fragment_id = args[1].get::<u32>().unwrap_or(0);
            let location = segment_location_cb(fragment_id);
            Some(location.to_value())
        });

        // Assemble.
        let mut elements = vec![
            &source, &depay, &parse, &tee, &stream_queue, &streaming_valve,
        ];
        if let Some(ref shim) = colorimetry_shim {
            elements.push(shim);
        }
        elements.extend([&decode_element, &convert, &scale]);
        if let Some(ref flip) = videoflip {
            elements.push(flip);
        }
        if let Some(ref overlay) = timeoverlay {
            elements.push(overlay);
        }
        elements.extend([
            &video_sink, &record_queue, &recording_valve, &record_parse, &splitmuxsink,
        ]);

        pipeline
            .add_many(elements.iter().copied())
            .map_err(|e| NvrError::GStreamer(format!("failed to add elements to pipeline: {e}")))?;

        depay.link(&parse).map_err(|e| NvrError::GStreamer(format!("link depay->parse: {e}")))?;
        parse.link(&tee).map_err(|e| NvrError::GStreamer(format!("link parse->tee: {e}")))?;

        // source has a dynamic pad; link once it appears.
        let depay_weak = depay.downgrade();
        source.connect_pad_added(move |_src, pad| {
            let Some(depay) = depay_weak.upgrade() else { return };
            let Some(sink_pad) = depay.static_pad("sink") else { return };
            if sink_pad.is_linked() {
                return;
            }
            if let Err(e) = pad.link(&sink_pad) {
                warn!(error = ?e, "failed to link rtspsrc pad to depayloader");
            }
        });

        // Streaming branch link chain.
        tee.link(&stream_queue).map_err(|e| NvrError::GStreamer(format!("link tee->stream-queue: {e}")))?;
        stream_queue
            .link(&streaming_valve)
            .map_err(|e| NvrError::GStreamer(format!("link stream-queue->streaming-valve: {e}")))?;

        let mut last = streaming_valve.clone();
        if let Some(ref shim) = colorimetry_shim {
            last.link(shim).map_err(|e| NvrError::GStreamer(format!("link into colorimetry-shim: {e}")))?;
            last = shim.clone();
        }
        last.link(&decode_element).map_err(|e| NvrError::GStreamer(format!("link into decoder: {e}")))?;
        decode_element.link(&convert).map_err(|e| NvrError::GStreamer(format!("link decoder->convert: {e}")))?;
        convert.link(&scale).map_err(|e| NvrError::GStreamer(format!("link convert->scale: {e}")))?;
        last = scale.clone();
        if let Some(ref flip) = videoflip {
            last.link(flip).map_err(|e| NvrError::GStreamer(format!("link scale->videoflip: {e}")))?;
            last = flip.clone();
        }
        if let Some(ref overlay) = timeoverlay {
            last.link(overlay).map_err(|e| NvrError::GStreamer(format!("link into timeoverlay: {e}")))?;
            last = overlay.clone();
        }
        last.link(&video_sink).map_err(|e| NvrError::GStreamer(format!("link into sink: {e}")))?;

        // Recording branch link chain.
        tee.link(&record_queue).map_err(|e| NvrError::GStreamer(format!("link tee->record-queue: {e}")))?;
        record_queue
            .link(&recording_valve)
            .map_err(|e| NvrError::GStreamer(format!("link record-queue->recording-valve: {e}")))?;
        recording_valve
            .link(&record_parse)
            .map_err(|e| NvrError::GStreamer(format!("link recording-valve->record-parse: {e}")))?;
        record_parse
            .link(&splitmuxsink)
            .map_err(|e| NvrError::GStreamer(format!("link record-parse->splitmuxsink: {e}")))?;

        Ok(PipelineGraph {
            pipeline,
            streaming_valve,
            recording_valve,
            splitmuxsink,
            decoder_src_pad_element: decode_element,
            video_sink,
        })
    }
}

/// ARGB-validated font color, converted to the colon-separated `clock-overlay`
/// color properties (`timeoverlay` uses `color` as packed ARGB already, so
/// this mostly just range-checks the value before handing it to the element).
fn validate_argb(value: u32) -> Result<u32> {
    // Any u32 is a structurally valid ARGB word; the check here exists so a
    // caller-supplied value of exactly 0 (fully transparent, invisible text)
    // is rejected rather than silently accepted.
    if value == 0 {
        return Err(NvrError::Config("font_color_argb must not be fully transparent (0x00000000)".into()));
    }
    Ok(value)
}

fn build_timeoverlay(camera: &CameraConfig) -> Result<Option<Element>> {
    if !camera.osd.enabled {
        return Ok(None);
    }
    let color = validate_argb(camera.osd.font_color_argb)?;
    match ElementFactory::make("timeoverlay")
        .name("osd")
        .property("color", color)
        .property("font-desc", format!("Sans {}", camera.osd.font_size))
        .property("time-format", camera.osd.format.clone())
        .property_from_str("valignment", osd_valignment(camera.osd.position))
        .property_from_str("halignment", osd_halignment(camera.osd.position))
        .build()
    {
        Ok(elem) => Ok(Some(elem)),
        Err(e) => {
            warn!(error = %e, "timeoverlay element unavailable, continuing without OSD");
            Ok(None)
        }
    }
}

fn osd_valignment(pos: crate::config::OsdPosition) -> &'static str {
    use crate::config::OsdPosition::*;
    match pos {
        TopLeft | TopRight => "top",
        BottomLeft | BottomRight => "bottom",
    }
}

fn osd_halignment(pos: crate::config::OsdPosition) -> &'static str {
    use crate::config::OsdPosition::*;
    match pos {
        TopLeft | BottomLeft => "left",
        TopRight | BottomRight => "right",
    }
}

fn build_videoflip(camera: &CameraConfig) -> Option<Element> {
    let transform = camera.transform?;
    let method = match (transform.flip_horizontal, transform.flip_vertical, transform.rotation) {
        (false, false, crate::config::Rotation::Deg0) => return None,
        (true, false, crate::config::Rotation::Deg0) => "horizontal-flip",
        (false, true, crate::config::Rotation::Deg0) => "vertical-flip",
        (false, false, crate::config::Rotation::Deg90) => "clockwise",
        (false, false, crate::config::Rotation::Deg180) => "rotate-180",
        (false, false, crate::config::Rotation::Deg270) => "counterclockwise",
        _ => "rotate-180",
    };
    match ElementFactory::make("videoflip")
        .name("flip")
        .property_from_str("method", method)
        .build()
    {
        Ok(elem) => Some(elem),
        Err(e) => {
            warn!(error = %e, "videoflip element unavailable, continuing without transform");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_argb_is_rejected() {
        assert!(validate_argb(0).is_err());
    }

    #[test]
    fn nonzero_argb_passes_through() {
        assert_eq!(validate_argb(0xFFFF_FFFF).unwrap(), 0xFFFF_FFFF);
    }
}
