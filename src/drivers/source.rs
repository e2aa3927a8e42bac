use std::thread;
use std::time::{Duration, Instant};

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::drivers::PipelineError;

/// One time point across every channel of the montage.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelSample {
    /// Seconds since acquisition start, derived from the running sample index.
    pub timestamp: f64,
    pub values: Vec<f32>,
}

/// Something that yields `[samples x channels]` blocks at a fixed rate.
///
/// `pull` blocks for roughly `duration`; that wait is the acquisition loop's
/// backpressure point.
pub trait SampleSource: Send {
    fn sample_rate_hz(&self) -> f32;
    fn channel_labels(&self) -> &[String];
    fn pull(&mut self, duration: Duration) -> Result<Array2<f32>, PipelineError>;
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn sample_rate_hz(&self) -> f32 {
        (**self).sample_rate_hz()
    }
    fn channel_labels(&self) -> &[String] {
        (**self).channel_labels()
    }
    fn pull(&mut self, duration: Duration) -> Result<Array2<f32>, PipelineError> {
        (**self).pull(duration)
    }
}

/// Converts a pulled block into timestamped samples, advancing `next_index`.
pub fn block_to_samples(
    block: &Array2<f32>,
    sample_rate_hz: f32,
    next_index: &mut u64,
) -> Vec<ChannelSample> {
    block
        .rows()
        .into_iter()
        .map(|row| {
            let timestamp = *next_index as f64 / sample_rate_hz as f64;
            *next_index += 1;
            ChannelSample {
                timestamp,
                values: row.to_vec(),
            }
        })
        .collect()
}

/// Keeps the long-run number of pulled samples equal to `elapsed * rate`
/// even when `duration * rate` is fractional.
#[derive(Clone, Debug)]
pub struct SamplePacer {
    sample_rate_hz: f64,
    carry: f64,
}
impl SamplePacer {
    pub fn new(sample_rate_hz: f32) -> Self {
        Self {
            sample_rate_hz: sample_rate_hz as f64,
            carry: 0.0,
        }
    }
    pub fn samples_for(&mut self, duration: Duration) -> usize {
        let exact = duration.as_secs_f64() * self.sample_rate_hz + self.carry;
        let whole = exact.floor();
        self.carry = exact - whole;
        whole as usize
    }
}

/// In-memory source useful for tests and deterministic playback.
///
/// Once the queue is exhausted it behaves like a silent device: it waits for
/// the requested duration and returns an empty block.
#[cfg(test)]
pub struct ManualSource {
    queue: std::collections::VecDeque<Array2<f32>>,
    channel_labels: Vec<String>,
    sample_rate_hz: f32,
}
#[cfg(test)]
impl ManualSource {
    pub fn new(
        channel_labels: Vec<String>,
        sample_rate_hz: f32,
        blocks: impl IntoIterator<Item = Array2<f32>>,
    ) -> Self {
        Self {
            queue: blocks.into_iter().collect(),
            channel_labels,
            sample_rate_hz,
        }
    }
}
#[cfg(test)]
impl SampleSource for ManualSource {
    fn sample_rate_hz(&self) -> f32 {
        self.sample_rate_hz
    }
    fn channel_labels(&self) -> &[String] {
        &self.channel_labels
    }
    fn pull(&mut self, duration: Duration) -> Result<Array2<f32>, PipelineError> {
        match self.queue.pop_front() {
            Some(block) => Ok(block),
            None => {
                thread::sleep(duration);
                Ok(Array2::zeros((0, self.channel_labels.len())))
            }
        }
    }
}

/// Sine component injected on one channel of a [`SyntheticSource`].
#[derive(Clone, Debug)]
pub struct Tone {
    pub channel: String,
    pub frequency_hz: f32,
    pub amplitude: f32,
}

/// Tone generator standing in for a headset.
pub struct SyntheticSource {
    channel_labels: Vec<String>,
    sample_rate_hz: f32,
    tones: Vec<(usize, Tone)>,
    noise_amplitude: f32,
    paced: bool,
    pacer: SamplePacer,
    produced: u64,
    started: Option<Instant>,
    rng: StdRng,
}
impl SyntheticSource {
    pub fn new(
        channel_labels: Vec<String>,
        sample_rate_hz: f32,
        tones: Vec<Tone>,
    ) -> Result<Self, PipelineError> {
        if sample_rate_hz <= 0.0 {
            return Err(PipelineError::InvalidSampleRate);
        }
        let tones = tones
            .into_iter()
            .map(|tone| {
                channel_labels
                    .iter()
                    .position(|label| *label == tone.channel)
                    .map(|idx| (idx, tone.clone()))
                    .ok_or(PipelineError::UnknownChannel(tone.channel))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            channel_labels,
            sample_rate_hz,
            tones,
            noise_amplitude: 0.0,
            paced: false,
            pacer: SamplePacer::new(sample_rate_hz),
            produced: 0,
            started: None,
            rng: StdRng::seed_from_u64(0x5EED),
        })
    }
    pub fn with_noise(mut self, amplitude: f32, seed: u64) -> Self {
        self.noise_amplitude = amplitude.abs();
        self.rng = StdRng::seed_from_u64(seed);
        self
    }
    /// When paced, `pull` sleeps so samples come out in real time.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }
    fn generate(&mut self, count: usize) -> Array2<f32> {
        let channels = self.channel_labels.len();
        let mut block = Array2::<f32>::zeros((count, channels));
        let rate = self.sample_rate_hz as f64;
        for (row, mut values) in block.rows_mut().into_iter().enumerate() {
            let t = (self.produced + row as u64) as f64 / rate;
            for (idx, tone) in &self.tones {
                let phase = 2.0 * std::f64::consts::PI * tone.frequency_hz as f64 * t;
                values[*idx] += tone.amplitude * phase.sin() as f32;
            }
            if self.noise_amplitude > 0.0 {
                for v in values.iter_mut() {
                    *v += self
                        .rng
                        .gen_range(-self.noise_amplitude..=self.noise_amplitude);
                }
            }
        }
        self.produced += count as u64;
        block
    }
}
impl SampleSource for SyntheticSource {
    fn sample_rate_hz(&self) -> f32 {
        self.sample_rate_hz
    }
    fn channel_labels(&self) -> &[String] {
        &self.channel_labels
    }
    fn pull(&mut self, duration: Duration) -> Result<Array2<f32>, PipelineError> {
        let count = self.pacer.samples_for(duration);
        let block = self.generate(count);
        if self.paced {
            let started = *self.started.get_or_insert_with(Instant::now);
            let due = Duration::from_secs_f64(self.produced as f64 / self.sample_rate_hz as f64);
            if let Some(wait) = due.checked_sub(started.elapsed()) {
                thread::sleep(wait);
            }
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }
    #[test]
    fn pacer_carries_fractional_samples() {
        let mut pacer = SamplePacer::new(256.0);
        let total: usize = (0..10)
            .map(|_| pacer.samples_for(Duration::from_millis(100)))
            .sum();
        assert_eq!(total, 256);
    }
    #[test]
    fn block_timestamps_follow_sample_index() {
        let block = Array2::<f32>::zeros((4, 2));
        let mut next = 256;
        let samples = block_to_samples(&block, 256.0, &mut next);
        assert_eq!(next, 260);
        assert_eq!(samples.len(), 4);
        assert!((samples[0].timestamp - 1.0).abs() < 1e-12);
        assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }
    #[test]
    fn synthetic_source_places_tones_on_named_channels() {
        let mut source = SyntheticSource::new(
            labels(&["F3", "F4", "Cz"]),
            256.0,
            vec![Tone {
                channel: "F4".into(),
                frequency_hz: 10.0,
                amplitude: 10.0,
            }],
        )
        .unwrap();
        let block = source.pull(Duration::from_secs(1)).unwrap();
        assert_eq!(block.dim(), (256, 3));
        let peak = block.column(1).iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        assert!(peak > 9.5 && peak <= 10.0);
        assert!(block.column(0).iter().all(|v| *v == 0.0));
    }
    #[test]
    fn synthetic_source_rejects_unknown_tone_channel() {
        let err = SyntheticSource::new(
            labels(&["F3"]),
            256.0,
            vec![Tone {
                channel: "O9".into(),
                frequency_hz: 10.0,
                amplitude: 1.0,
            }],
        );
        assert!(matches!(err, Err(PipelineError::UnknownChannel(_))));
    }
    #[test]
    fn manual_source_goes_silent_when_exhausted() {
        let mut source = ManualSource::new(labels(&["A", "B"]), 100.0, vec![Array2::zeros((3, 2))]);
        assert_eq!(source.pull(Duration::from_millis(1)).unwrap().nrows(), 3);
        assert_eq!(source.pull(Duration::from_millis(1)).unwrap().dim(), (0, 2));
    }
}
