use log::{info, warn};

use crate::stats::SummaryStats;

/// Spread scale used whenever calibration cannot produce a usable one.
pub const DEFAULT_SPREAD_SCALE: f64 = 0.1;
pub const DEFAULT_ZERO_POINT: f64 = 0.0;
/// Spreads at or below this are treated as zero.
const MIN_SPREAD: f64 = 1e-12;

/// Zero point and scale feeding the level scaler for the rest of a session.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationResult {
    pub zero_point: f64,
    pub spread_scale: f64,
    pub sample_count: usize,
    pub mean: f64,
    pub std_dev: f64,
}
impl CalibrationResult {
    /// Parameters restored from a persisted record; the raw statistics are unknown.
    pub fn restored(zero_point: f64, spread_scale: f64) -> Self {
        Self {
            zero_point,
            spread_scale: sanitize_spread_scale(spread_scale),
            sample_count: 0,
            mean: zero_point,
            std_dev: 0.0,
        }
    }
}
impl Default for CalibrationResult {
    fn default() -> Self {
        Self::restored(DEFAULT_ZERO_POINT, DEFAULT_SPREAD_SCALE)
    }
}

/// Returns `scale` when it is a usable positive number, the default otherwise.
pub fn sanitize_spread_scale(scale: f64) -> f64 {
    if scale.is_finite() && scale > MIN_SPREAD {
        scale
    } else {
        DEFAULT_SPREAD_SCALE
    }
}

/// How many standard deviations span how many display units.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationRatio {
    pub sd_span: f64,
    pub display_units: f64,
}
impl Default for CalibrationRatio {
    fn default() -> Self {
        // mean sits on the zero line, 3 SD reach the top of the display
        Self {
            sd_span: 3.0,
            display_units: 8.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CalibrationOutcome {
    Computed(CalibrationResult),
    /// Operator abort or no usable samples: the previous parameters stay.
    Aborted(CalibrationResult),
}
impl CalibrationOutcome {
    pub fn result(&self) -> CalibrationResult {
        match self {
            CalibrationOutcome::Computed(r) | CalibrationOutcome::Aborted(r) => *r,
        }
    }
}

/// Accumulates metric samples while `Collecting`, then resolves once.
pub struct CalibrationEngine {
    ratio: CalibrationRatio,
    samples: Vec<f64>,
    rejected: usize,
}
impl CalibrationEngine {
    pub fn new(ratio: CalibrationRatio) -> Self {
        Self {
            ratio,
            samples: Vec::new(),
            rejected: 0,
        }
    }
    /// Returns false (and counts a gap) for non-finite values.
    pub fn record(&mut self, value: f64) -> bool {
        if value.is_finite() {
            self.samples.push(value);
            true
        } else {
            self.rejected += 1;
            false
        }
    }
    pub fn extend(&mut self, values: impl IntoIterator<Item = f64>) {
        for v in values {
            self.record(v);
        }
    }
    pub fn rejected(&self) -> usize {
        self.rejected
    }
    pub fn abort(self, previous: CalibrationResult) -> CalibrationOutcome {
        info!(
            "calibration aborted after {} samples; keeping zero {:.4}, scale {:.4}",
            self.samples.len(),
            previous.zero_point,
            previous.spread_scale
        );
        CalibrationOutcome::Aborted(previous)
    }
    /// Duration elapsed: derive zero point and scale from the collected samples.
    pub fn complete(self, previous: CalibrationResult) -> CalibrationOutcome {
        let Some(stats) = SummaryStats::from_values(&self.samples) else {
            warn!("calibration collected no usable samples; keeping previous parameters");
            return CalibrationOutcome::Aborted(previous);
        };
        let spread = stats.std_dev;
        let spread_scale = if spread.is_finite() && spread > MIN_SPREAD {
            (self.ratio.sd_span * spread) / self.ratio.display_units
        } else {
            warn!("calibration spread is degenerate ({spread}); using default scale");
            DEFAULT_SPREAD_SCALE
        };
        let result = CalibrationResult {
            zero_point: stats.mean,
            spread_scale: sanitize_spread_scale(spread_scale),
            sample_count: stats.count,
            mean: stats.mean,
            std_dev: spread,
        };
        info!(
            "calibration: mean={:.5} std={:.5} over {} samples ({} rejected)",
            stats.mean, spread, stats.count, self.rejected
        );
        CalibrationOutcome::Computed(result)
    }
}
