//! Configuration loaded from a TOML file.
//!
//! The pipeline engine never reaches into a global config singleton — it is
//! handed a [`Config`] (or a single [`CameraConfig`]) at construction time.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{NvrError, Result};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Global recording storage parameters.
    pub storage: StorageConfig,
    /// Cameras to build pipeline engines for.
    pub cameras: Vec<CameraConfig>,
    /// Default decoder preference order, overridable per camera.
    #[serde(default = "default_decoder_preference")]
    pub decoder_preference: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NvrError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| NvrError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(NvrError::Config("No cameras defined".into()));
        }
        if self.storage.rotation_minutes == 0 {
            return Err(NvrError::Config("rotation_minutes must be > 0".into()));
        }
        if self.storage.min_free_gb <= 0.0 {
            return Err(NvrError::Config("min_free_gb must be > 0".into()));
        }
        for cam in &self.cameras {
            if cam.id.is_empty() {
                return Err(NvrError::Config("camera id must not be empty".into()));
            }
        }
        Ok(())
    }
}

/// Global storage parameters, consumed by the rotator and the storage service.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory under which `{camera_id}/{YYYYMMDD}/...` segments are written.
    pub root: PathBuf,
    /// Container format for recorded segments.
    #[serde(default)]
    pub container_format: ContainerFormat,
    /// Default maximum segment duration, in minutes, before a keyframe-aligned split.
    #[serde(default = "default_rotation_minutes")]
    pub rotation_minutes: u64,
    /// Minimum free space (GB) required before `IDLE -> RECORDING` is allowed.
    #[serde(default = "default_min_free_gb")]
    pub min_free_gb: f64,
    /// Age (days) beyond which `auto_cleanup` considers a file eligible for deletion.
    #[serde(default = "default_cleanup_max_age_days")]
    pub cleanup_max_age_days: u64,
    /// Target free space (GB) that `auto_cleanup` tries to reach.
    #[serde(default = "default_cleanup_min_free_target_gb")]
    pub cleanup_min_free_target_gb: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    #[default]
    Mp4,
    Mkv,
}

impl ContainerFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mkv => "mkv",
        }
    }

    pub fn muxer_factory_name(self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4mux",
            ContainerFormat::Mkv => "matroskamux",
        }
    }
}

/// Per-camera configuration.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Stable identifier, used for directory/file naming.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    /// RTSP URL, may embed credentials.
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub recording_on_start: bool,
    #[serde(default)]
    pub transform: Option<VideoTransform>,
    /// Per-camera decoder preference override; falls back to `Config::decoder_preference`.
    #[serde(default)]
    pub decoder_preference: Option<Vec<String>>,
    #[serde(default)]
    pub osd: OsdConfig,
    #[serde(default)]
    pub rtsp: RtspConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub recording_retry: RecordingRetryConfig,
    /// Per-camera override of `StorageConfig::rotation_minutes`.
    #[serde(default)]
    pub rotation_minutes: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
pub struct VideoTransform {
    #[serde(default)]
    pub flip_horizontal: bool,
    #[serde(default)]
    pub flip_vertical: bool,
    #[serde(default)]
    pub rotation: Rotation,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

/// On-screen timestamp overlay parameters.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OsdConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `strftime`-style format string passed to the `timeoverlay`-like element.
    #[serde(default = "default_osd_format")]
    pub format: String,
    #[serde(default)]
    pub position: OsdPosition,
    /// Font color as packed ARGB (0xAARRGGBB); validated before use (§4.2).
    #[serde(default = "default_font_color_argb")]
    pub font_color_argb: u32,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
}

impl Default for OsdConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            format: default_osd_format(),
            position: OsdPosition::default(),
            font_color_argb: default_font_color_argb(),
            font_size: default_font_size(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum OsdPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct RtspConfig {
    #[serde(default = "default_tcp_timeout_ms")]
    pub tcp_timeout_ms: u64,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            tcp_timeout_ms: default_tcp_timeout_ms(),
            connection_timeout_secs: default_connection_timeout_secs(),
            latency_ms: default_latency_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct ReconnectConfig {
    #[serde(default = "default_backoff_ceiling_secs")]
    pub backoff_ceiling_secs: u64,
    /// 0 means unlimited.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_ceiling_secs: default_backoff_ceiling_secs(),
            max_attempts: default_max_reconnect_attempts(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_watchdog_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_watchdog_timeout_secs(),
            check_interval_secs: default_watchdog_check_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct RecordingRetryConfig {
    #[serde(default = "default_recording_retry_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_recording_retry_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RecordingRetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_recording_retry_interval_secs(),
            max_attempts: default_recording_retry_max_attempts(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_decoder_preference() -> Vec<String> {
    vec!["v4l2h264dec".into(), "avdec_h264".into()]
}
fn default_rotation_minutes() -> u64 {
    1
}
fn default_min_free_gb() -> f64 {
    1.0
}
fn default_cleanup_max_age_days() -> u64 {
    7
}
fn default_cleanup_min_free_target_gb() -> f64 {
    2.0
}
fn default_osd_format() -> String {
    "%Y-%m-%d %H:%M:%S".to_string()
}
fn default_font_color_argb() -> u32 {
    0xFFFF_FFFF
}
fn default_font_size() -> u32 {
    16
}
fn default_tcp_timeout_ms() -> u64 {
    5_000
}
fn default_connection_timeout_secs() -> u64 {
    10
}
fn default_latency_ms() -> u32 {
    200
}
fn default_backoff_ceiling_secs() -> u64 {
    60
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_watchdog_timeout_secs() -> u64 {
    30
}
fn default_watchdog_check_interval_secs() -> u64 {
    5
}
fn default_recording_retry_interval_secs() -> u64 {
    6
}
fn default_recording_retry_max_attempts() -> u32 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let toml_str = r#"
            [storage]
            root = "/var/lib/nvr"

            [[cameras]]
            id = "cam1"
            name = "Front door"
            url = "rtsp://127.0.0.1/stream"
        "#;
        let cfg: Config = toml::from_str(toml_str).expect("parse");
        assert_eq!(cfg.storage.rotation_minutes, 1);
        assert_eq!(cfg.storage.container_format, ContainerFormat::Mp4);
        assert_eq!(cfg.cameras[0].reconnect.max_attempts, 10);
        assert_eq!(cfg.cameras[0].watchdog.timeout_secs, 30);
        assert!(!cfg.cameras[0].recording_on_start);
    }

    #[test]
    fn rejects_empty_camera_list() {
        let toml_str = r#"
            [storage]
            root = "/var/lib/nvr"
            cameras = []
        "#;
        let parsed: std::result::Result<Config, _> = toml::from_str(toml_str);
        // Either parse fails for a missing `cameras` key or validate() rejects it.
        match parsed {
            Ok(cfg) => assert!(cfg.validate().is_err()),
            Err(_) => {}
        }
    }
}
