use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::drivers::metric::FeedbackMode;
use crate::drivers::source::{block_to_samples, SampleSource};
use crate::drivers::spectral::{FrequencyBand, SpectralPowerEstimator};
use crate::drivers::{PipelineError, SlidingWindow, SlidingWindowBuffer};

/// Channels compared by the metric, and the one they are referenced against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HemisphereMontage {
    pub left: String,
    pub right: String,
    pub reference: String,
}
impl Default for HemisphereMontage {
    fn default() -> Self {
        Self {
            left: "F3".into(),
            right: "F4".into(),
            reference: "Cz".into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HemispherePowers {
    pub left: f64,
    pub right: f64,
}
impl HemispherePowers {
    pub fn metric(&self, mode: FeedbackMode) -> Result<f64, PipelineError> {
        mode.compute(self.left, self.right)
    }
}

/// One analysis of a snapshot: band power on both hemispheres.
#[derive(Clone, Debug)]
pub struct AnalysisPass {
    estimator: SpectralPowerEstimator,
    montage: HemisphereMontage,
}
impl AnalysisPass {
    pub fn new(montage: HemisphereMontage, band: FrequencyBand) -> Self {
        Self {
            estimator: SpectralPowerEstimator::new(montage.reference.clone(), band),
            montage,
        }
    }
    pub fn run(&self, window: &SlidingWindow) -> Result<HemispherePowers, PipelineError> {
        let powers = self
            .estimator
            .estimate(window, &[&self.montage.left, &self.montage.right])?;
        Ok(HemispherePowers {
            left: powers[0],
            right: powers[1],
        })
    }
}

/// Pulls blocks from a source into the rolling buffer and hands out snapshots.
pub struct SignalPipeline<S: SampleSource> {
    source: S,
    buffer: SlidingWindowBuffer,
    next_index: u64,
}
impl<S: SampleSource> SignalPipeline<S> {
    pub fn new(source: S, window_seconds: f32) -> Result<Self, PipelineError> {
        let buffer = SlidingWindowBuffer::with_window_seconds(
            source.channel_labels().to_vec(),
            source.sample_rate_hz(),
            window_seconds,
        )?;
        Ok(Self {
            source,
            buffer,
            next_index: 0,
        })
    }
    pub fn buffer(&self) -> &SlidingWindowBuffer {
        &self.buffer
    }
    /// Pulls `tick` worth of samples. Returns `None` when the source had nothing.
    /// A source error empties the buffer so no window spans the dropout.
    pub fn pump_once(&mut self, tick: Duration) -> Result<Option<SlidingWindow>, PipelineError> {
        let block = match self.source.pull(tick) {
            Ok(block) => block,
            Err(err) => {
                if !self.buffer.is_empty() {
                    debug!("source dropped out; discarding {} buffered samples", self.buffer.len());
                    self.buffer.clear();
                }
                return Err(err);
            }
        };
        if block.nrows() == 0 {
            return Ok(None);
        }
        let samples = block_to_samples(&block, self.source.sample_rate_hz(), &mut self.next_index);
        self.buffer.append(samples)?;
        Ok(Some(self.buffer.snapshot()))
    }
}
