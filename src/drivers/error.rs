use std::path::PathBuf;

use thiserror::Error;

use crate::drivers::FeedbackMode;
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("sample rate must be greater than zero")]
    InvalidSampleRate,
    #[error("channel count mismatch: expected {expected}, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },
    #[error("channel '{0}' is not part of the montage")]
    UnknownChannel(String),
    #[error("insufficient data: {samples} samples, need at least {required}")]
    InsufficientData { samples: usize, required: usize },
    #[error("band power must be positive (left {left}, right {right})")]
    NonPositivePower { left: f64, right: f64 },
    #[error("sample carries {0} values, expected 1 or 2")]
    MalformedSample(usize),
    #[error("source not available: {0}")]
    SourceUnavailable(String),
    #[error("stream '{0}' not available")]
    StreamUnavailable(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("stream carries {carried}, but the session needs {needed:?}")]
    StreamContentMismatch { carried: String, needed: FeedbackMode },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence and record-parsing failures.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("line {line}: expected `name = value`")]
    Malformed { line: usize },
    #[error("line {line}: unknown key '{key}'")]
    UnknownKey { line: usize, key: String },
    #[error("line {line}: invalid value for '{key}': {value}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
    #[error("subject name '{name}' is shorter than {min} characters")]
    NameTooShort { name: String, min: usize },
    #[error("subject file {} already exists", .0.display())]
    AlreadyExists(PathBuf),
    #[error("{}: line {line}: {reason}", path.display())]
    ReplayFormat {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
