use serde::{Deserialize, Serialize};

use crate::drivers::PipelineError;

/// How left and right alpha power combine into the feedback metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackMode {
    /// log10(right) - log10(left); positive means right-dominant alpha
    /// (relatively more left-frontal activity, Davidson 1995).
    Asymmetry,
    /// log10(right) + log10(left)
    Relaxation,
}
impl FeedbackMode {
    pub fn compute(self, left_power: f64, right_power: f64) -> Result<f64, PipelineError> {
        let valid = |p: f64| p.is_finite() && p > 0.0;
        if !valid(left_power) || !valid(right_power) {
            return Err(PipelineError::NonPositivePower {
                left: left_power,
                right: right_power,
            });
        }
        Ok(match self {
            FeedbackMode::Asymmetry => right_power.log10() - left_power.log10(),
            FeedbackMode::Relaxation => right_power.log10() + left_power.log10(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn equal_powers_have_zero_asymmetry() {
        for p in [1e-6, 0.5, 1.0, 42.0, 1e9] {
            assert_eq!(FeedbackMode::Asymmetry.compute(p, p).unwrap(), 0.0);
        }
    }
    #[test]
    fn asymmetry_rises_with_right_and_falls_with_left() {
        let base = FeedbackMode::Asymmetry.compute(2.0, 3.0).unwrap();
        assert!(FeedbackMode::Asymmetry.compute(2.0, 3.5).unwrap() > base);
        assert!(FeedbackMode::Asymmetry.compute(2.5, 3.0).unwrap() < base);
    }
    #[test]
    fn relaxation_sums_log_powers() {
        let v = FeedbackMode::Relaxation.compute(10.0, 100.0).unwrap();
        assert!((v - 3.0).abs() < 1e-12);
    }
    #[test]
    fn non_positive_power_is_rejected() {
        assert!(FeedbackMode::Asymmetry.compute(0.0, 1.0).is_err());
        assert!(FeedbackMode::Relaxation.compute(1.0, -2.0).is_err());
        assert!(FeedbackMode::Asymmetry.compute(f64::NAN, 1.0).is_err());
    }
}
