use std::ops::RangeInclusive;

use rustfft::{num_complex::Complex64, FftPlanner};

use crate::drivers::{PipelineError, SlidingWindow};

/// Frequency band with inclusive edges in Hz.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrequencyBand {
    pub low_hz: f32,
    pub high_hz: f32,
}
impl FrequencyBand {
    pub const ALPHA: FrequencyBand = FrequencyBand {
        low_hz: 8.0,
        high_hz: 12.0,
    };
    /// Minimum window length that holds one full cycle of the lowest frequency.
    pub fn min_samples(&self, sample_rate_hz: f32) -> usize {
        (sample_rate_hz / self.low_hz).ceil() as usize
    }
    /// DFT bins of an `n`-point window at `sample_rate_hz` whose centre
    /// frequency lies inside the band. `None` when the bin grid misses it.
    pub fn bins(&self, sample_rate_hz: f32, n: usize) -> Option<RangeInclusive<usize>> {
        if n == 0 || sample_rate_hz <= 0.0 {
            return None;
        }
        let resolution = sample_rate_hz as f64 / n as f64;
        // Tolerate float noise so that e.g. 8 Hz at 1 Hz resolution is bin 8.
        let lo = (self.low_hz as f64 / resolution - 1e-9).ceil() as usize;
        let hi = ((self.high_hz as f64 / resolution + 1e-9).floor() as usize).min(n / 2);
        (lo <= hi).then_some(lo..=hi)
    }
}

/// Symmetric Hann taper of length `n`.
pub fn hann(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    let denom = (n - 1) as f64;
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / denom).cos())
        .collect()
}

/// Re-referenced, Hann-tapered band power per analysed channel.
#[derive(Clone, Debug)]
pub struct SpectralPowerEstimator {
    reference: String,
    band: FrequencyBand,
}
impl SpectralPowerEstimator {
    pub fn new(reference: impl Into<String>, band: FrequencyBand) -> Self {
        Self {
            reference: reference.into(),
            band,
        }
    }
    /// Band power for each of `channels`, in the order given.
    pub fn estimate(
        &self,
        window: &SlidingWindow,
        channels: &[&str],
    ) -> Result<Vec<f64>, PipelineError> {
        let n = window.len();
        let required = self.band.min_samples(window.sample_rate_hz);
        if n < required {
            return Err(PipelineError::InsufficientData {
                samples: n,
                required,
            });
        }
        let bins = self
            .band
            .bins(window.sample_rate_hz, n)
            .ok_or(PipelineError::InsufficientData {
                samples: n,
                required: n + 1,
            })?;
        let reference_idx = window.channel_index(&self.reference)?;
        let indices = channels
            .iter()
            .map(|label| window.channel_index(label))
            .collect::<Result<Vec<_>, _>>()?;

        let taper = hann(n);
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(n);
        let powers = indices
            .into_iter()
            .map(|idx| {
                let mut buffer: Vec<Complex64> = window
                    .samples
                    .iter()
                    .zip(&taper)
                    .map(|(sample, w)| {
                        let referenced = sample.values[idx] as f64 - sample.values[reference_idx] as f64;
                        Complex64::new(referenced * w, 0.0)
                    })
                    .collect();
                fft.process(&mut buffer);
                buffer[bins.clone()]
                    .iter()
                    .map(|c| c.norm_sqr() / n as f64)
                    .sum::<f64>()
            })
            .collect();
        Ok(powers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ChannelSample;
    use std::sync::Arc;
    fn window_from(channels: &[(&str, Box<dyn Fn(f64) -> f64>)], rate: f32, n: usize) -> SlidingWindow {
        let labels: Vec<String> = channels.iter().map(|(l, _)| l.to_string()).collect();
        let samples = (0..n)
            .map(|i| {
                let t = i as f64 / rate as f64;
                ChannelSample {
                    timestamp: t,
                    values: channels.iter().map(|(_, f)| f(t) as f32).collect(),
                }
            })
            .collect();
        SlidingWindow {
            sample_rate_hz: rate,
            channel_labels: Arc::from(labels),
            samples,
        }
    }
    fn flat() -> Box<dyn Fn(f64) -> f64> {
        Box::new(|_| 0.0)
    }
    fn sine(freq: f64, amp: f64) -> Box<dyn Fn(f64) -> f64> {
        Box::new(move |t| amp * (2.0 * std::f64::consts::PI * freq * t).sin())
    }
    #[test]
    fn bin_range_follows_rate_and_length() {
        let alpha = FrequencyBand::ALPHA;
        assert_eq!(alpha.bins(256.0, 256), Some(8..=12));
        assert_eq!(alpha.bins(256.0, 512), Some(16..=24));
        assert_eq!(alpha.bins(256.0, 128), Some(4..=6));
        assert_eq!(alpha.bins(250.0, 250), Some(8..=12));
        // 64 Hz resolution has no bin between 8 and 12 Hz
        assert_eq!(alpha.bins(256.0, 4), None);
    }
    #[test]
    fn in_band_sine_beats_out_of_band_sine() {
        let win = window_from(
            &[
                ("A", sine(10.0, 5.0)),
                ("B", sine(20.0, 5.0)),
                ("Ref", flat()),
            ],
            256.0,
            256,
        );
        let est = SpectralPowerEstimator::new("Ref", FrequencyBand::ALPHA);
        let powers = est.estimate(&win, &["A", "B"]).unwrap();
        assert!(powers[0] > powers[1] * 100.0, "{powers:?}");
    }
    #[test]
    fn reference_is_subtracted_before_the_transform() {
        let win = window_from(
            &[("A", sine(10.0, 5.0)), ("Ref", sine(10.0, 5.0))],
            256.0,
            256,
        );
        let est = SpectralPowerEstimator::new("Ref", FrequencyBand::ALPHA);
        let powers = est.estimate(&win, &["A"]).unwrap();
        assert!(powers[0].abs() < 1e-9);
    }
    #[test]
    fn short_window_reports_insufficient_data() {
        let win = window_from(&[("A", sine(10.0, 1.0)), ("Ref", flat())], 256.0, 20);
        let est = SpectralPowerEstimator::new("Ref", FrequencyBand::ALPHA);
        assert!(matches!(
            est.estimate(&win, &["A"]),
            Err(PipelineError::InsufficientData {
                samples: 20,
                required: 32
            })
        ));
    }
    #[test]
    fn unknown_channel_is_an_error() {
        let win = window_from(&[("A", sine(10.0, 1.0))], 256.0, 256);
        let est = SpectralPowerEstimator::new("Cz", FrequencyBand::ALPHA);
        assert!(matches!(
            est.estimate(&win, &["A"]),
            Err(PipelineError::UnknownChannel(c)) if c == "Cz"
        ));
    }
    #[test]
    fn hann_is_symmetric_and_zero_at_edges() {
        let w = hann(9);
        assert!(w[0].abs() < 1e-12 && w[8].abs() < 1e-12);
        assert!((w[4] - 1.0).abs() < 1e-12);
        assert!((w[2] - w[6]).abs() < 1e-12);
    }
}
