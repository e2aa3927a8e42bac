// src/stream/mod.rs
// 指标发布通道：单生产者、多订阅者、尽力而为
pub mod local;
pub mod network;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::drivers::{FeedbackMode, PipelineError};

pub use local::{LocalHub, LocalInlet};
pub use network::{LslInlet, LslOutlet};

pub const DEFAULT_STREAM_NAME: &str = "BCIAlphaLevel";

/// What a stream carries. Announced with the stream so a consumer can refuse
/// a scalar derived under the wrong mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamContent {
    /// `[left, right]` band powers.
    Powers,
    /// One value already derived under this mode.
    Metric(FeedbackMode),
}
impl StreamContent {
    pub fn channels(self) -> u32 {
        match self {
            StreamContent::Powers => 2,
            StreamContent::Metric(_) => 1,
        }
    }
    pub fn stream_type(self) -> &'static str {
        match self {
            StreamContent::Powers => "AlphaPowers",
            StreamContent::Metric(FeedbackMode::Asymmetry) => "AlphaAsymmetry",
            StreamContent::Metric(FeedbackMode::Relaxation) => "AlphaRelaxation",
        }
    }
    pub fn from_stream_type(stream_type: &str) -> Option<Self> {
        match stream_type {
            "AlphaPowers" => Some(StreamContent::Powers),
            "AlphaAsymmetry" => Some(StreamContent::Metric(FeedbackMode::Asymmetry)),
            "AlphaRelaxation" => Some(StreamContent::Metric(FeedbackMode::Relaxation)),
            _ => None,
        }
    }
    /// Whether a session running `mode` can use this stream.
    pub fn serves(self, mode: FeedbackMode) -> bool {
        match self {
            StreamContent::Powers => true,
            StreamContent::Metric(published) => published == mode,
        }
    }
}

/// One published tuple: `[left, right]` band powers or a single derived metric.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub seq: u64,
    pub timestamp: f64,
    pub values: Vec<f32>,
}
impl MetricSample {
    pub fn powers(seq: u64, timestamp: f64, left: f64, right: f64) -> Self {
        Self {
            seq,
            timestamp,
            values: vec![left as f32, right as f32],
        }
    }
    pub fn scalar(seq: u64, timestamp: f64, value: f64) -> Self {
        Self {
            seq,
            timestamp,
            values: vec![value as f32],
        }
    }
    /// `(left, right)` when the sample carries a power pair.
    pub fn power_pair(&self) -> Option<(f64, f64)> {
        match self.values.as_slice() {
            [left, right] => Some((*left as f64, *right as f64)),
            _ => None,
        }
    }
    /// Metric value under `mode`; scalar samples are taken as already derived.
    pub fn metric(&self, mode: FeedbackMode) -> Result<f64, PipelineError> {
        match self.values.as_slice() {
            [left, right] => mode.compute(*left as f64, *right as f64),
            [value] => Ok(*value as f64),
            other => Err(PipelineError::MalformedSample(other.len())),
        }
    }
}

/// Producer side of a named metric stream.
pub trait MetricOutlet: Send + Sync {
    fn push_sample(&self, sample: &MetricSample) -> Result<(), PipelineError>;
}

/// Consumer side. Only samples published after subscription are seen.
pub trait MetricInlet: Send {
    fn content(&self) -> StreamContent;
    /// Waits up to `timeout` for the next sample.
    fn pull_sample(&mut self, timeout: Duration) -> Result<Option<MetricSample>, PipelineError>;
    /// Discards everything queued so far and returns how many samples that was.
    fn drain(&mut self) -> usize;
}

impl<T: MetricInlet + ?Sized> MetricInlet for Box<T> {
    fn content(&self) -> StreamContent {
        (**self).content()
    }
    fn pull_sample(&mut self, timeout: Duration) -> Result<Option<MetricSample>, PipelineError> {
        (**self).pull_sample(timeout)
    }
    fn drain(&mut self) -> usize {
        (**self).drain()
    }
}
