//! # Error Module
//!
//! Error taxonomy for the tuner pipeline. Configuration problems fail before
//! any stream is opened; device and stream problems are surfaced to the caller
//! of `start`. Nothing in here is raised per analysis frame: a window that
//! cannot be analyzed yields a zero-confidence estimate instead.

use thiserror::Error;

/// Errors returned by the tuner core.
#[derive(Error, Debug)]
pub enum TunerError {
    /// The input device is missing, busy or access was denied.
    #[error("audio device unavailable: {0}")]
    Device(String),

    /// The stream could not be built, started, or was interrupted while running.
    #[error("audio stream error: {0}")]
    Stream(String),

    /// Neither the requested nor a fallback sample rate/format is supported.
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// The analysis window cannot hold two periods of the lowest searchable frequency.
    #[error(
        "window of {window_size} samples is too short for {min_frequency_hz} Hz (needs at least {required})"
    )]
    InsufficientWindow {
        window_size: usize,
        min_frequency_hz: f32,
        required: usize,
    },

    #[error("invalid configuration value for `{field}`: {message}")]
    InvalidConfig { field: &'static str, message: String },

    #[error("config file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

impl TunerError {
    /// Whether retrying `start` later may succeed.
    ///
    /// Only stream interruptions are transient; device, format and
    /// configuration errors will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, TunerError::Stream(_))
    }
}

/// Result type alias for tuner operations.
pub type Result<T> = std::result::Result<T, TunerError>;
