// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

use crate::fault::FaultKind;

#[derive(Debug, Error)]
pub enum NvrError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("GStreamer error: {0}")]
    GStreamer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Camera '{id}' connection failed: {reason}")]
    CameraConnection { id: String, reason: String },

    #[error("Recording path validation failed: {0}")]
    PathValidation(String),

    #[error("fault classified as {kind:?}: {message}")]
    Fault { kind: FaultKind, message: String },

    #[error("operation invalid in current state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, NvrError>;
