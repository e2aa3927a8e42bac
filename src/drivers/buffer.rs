use std::collections::VecDeque;
use std::sync::Arc;

use log::warn;

use crate::drivers::{ChannelSample, PipelineError};

/// Immutable copy of the trailing window, safe to hand to another thread.
#[derive(Clone, Debug)]
pub struct SlidingWindow {
    pub sample_rate_hz: f32,
    pub channel_labels: Arc<[String]>,
    pub samples: Vec<ChannelSample>, // oldest first
}
impl SlidingWindow {
    pub fn len(&self) -> usize {
        self.samples.len()
    }
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
    pub fn channel_index(&self, label: &str) -> Result<usize, PipelineError> {
        self.channel_labels
            .iter()
            .position(|l| l == label)
            .ok_or_else(|| PipelineError::UnknownChannel(label.to_string()))
    }
    /// Time series of a single channel.
    pub fn channel(&self, idx: usize) -> Vec<f32> {
        self.samples.iter().map(|s| s.values[idx]).collect()
    }
}

/// Rolling buffer holding at most `window_seconds * sample_rate` samples.
pub struct SlidingWindowBuffer {
    samples: VecDeque<ChannelSample>,
    channel_labels: Arc<[String]>,
    sample_rate_hz: f32,
    capacity: usize,
}
impl SlidingWindowBuffer {
    pub fn with_window_seconds(
        channel_labels: Vec<String>,
        sample_rate_hz: f32,
        window_seconds: f32,
    ) -> Result<Self, PipelineError> {
        if sample_rate_hz <= 0.0 {
            return Err(PipelineError::InvalidSampleRate);
        }
        let capacity = ((sample_rate_hz * window_seconds).round() as usize).max(1);
        Ok(Self {
            samples: VecDeque::with_capacity(capacity),
            channel_labels: channel_labels.into(),
            sample_rate_hz,
            capacity,
        })
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    pub fn len(&self) -> usize {
        self.samples.len()
    }
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }
    /// Appends in arrival order and trims the head. Returns how many samples
    /// were kept; samples whose timestamp does not advance are discarded.
    pub fn append(
        &mut self,
        samples: impl IntoIterator<Item = ChannelSample>,
    ) -> Result<usize, PipelineError> {
        let expected = self.channel_labels.len();
        let mut kept = 0;
        for sample in samples {
            if sample.values.len() != expected {
                return Err(PipelineError::ChannelMismatch {
                    expected,
                    actual: sample.values.len(),
                });
            }
            if let Some(last) = self.samples.back() {
                if sample.timestamp <= last.timestamp {
                    warn!(
                        "discarding out-of-order sample at {:.4}s (last {:.4}s)",
                        sample.timestamp, last.timestamp
                    );
                    continue;
                }
            }
            if self.samples.len() == self.capacity {
                self.samples.pop_front();
            }
            self.samples.push_back(sample);
            kept += 1;
        }
        Ok(kept)
    }
    /// Forgets everything buffered, e.g. after the source dropped out.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
    pub fn snapshot(&self) -> SlidingWindow {
        SlidingWindow {
            sample_rate_hz: self.sample_rate_hz,
            channel_labels: Arc::clone(&self.channel_labels),
            samples: self.samples.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn sample(t: f64, v: f32) -> ChannelSample {
        ChannelSample {
            timestamp: t,
            values: vec![v, -v],
        }
    }
    fn buffer(window_seconds: f32) -> SlidingWindowBuffer {
        SlidingWindowBuffer::with_window_seconds(vec!["L".into(), "R".into()], 10.0, window_seconds)
            .unwrap()
    }
    #[test]
    fn never_exceeds_cap_and_keeps_latest_in_order() {
        let mut buf = buffer(1.0);
        let mut t = 0;
        for chunk in [3usize, 7, 1, 12, 5] {
            let batch: Vec<_> = (0..chunk)
                .map(|_| {
                    t += 1;
                    sample(t as f64 / 10.0, t as f32)
                })
                .collect();
            buf.append(batch).unwrap();
            assert!(buf.len() <= buf.capacity());
            let snap = buf.snapshot();
            let newest = snap.samples.last().unwrap().values[0];
            assert_eq!(newest, t as f32);
            let values = snap.channel(0);
            assert!(values.windows(2).all(|w| w[1] == w[0] + 1.0));
        }
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.snapshot().channel(0)[0], (t - 9) as f32);
    }
    #[test]
    fn rejects_wrong_channel_count() {
        let mut buf = buffer(1.0);
        let err = buf.append(vec![ChannelSample {
            timestamp: 0.0,
            values: vec![1.0],
        }]);
        assert!(matches!(
            err,
            Err(PipelineError::ChannelMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }
    #[test]
    fn drops_samples_that_do_not_advance() {
        let mut buf = buffer(1.0);
        assert_eq!(buf.append(vec![sample(0.2, 1.0), sample(0.1, 2.0), sample(0.2, 3.0)]).unwrap(), 1);
        assert_eq!(buf.len(), 1);
    }
    #[test]
    fn snapshot_is_detached_from_later_appends() {
        let mut buf = buffer(0.5);
        buf.append(vec![sample(0.0, 1.0)]).unwrap();
        let snap = buf.snapshot();
        buf.append(vec![sample(0.1, 2.0)]).unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(buf.len(), 2);
    }
    #[test]
    fn clear_starts_a_fresh_window() {
        let mut buf = buffer(1.0);
        buf.append((1..=10).map(|t| sample(t as f64 / 10.0, t as f32))).unwrap();
        assert!(buf.is_full());
        buf.clear();
        assert!(buf.is_empty());
        buf.append(vec![sample(2.0, 20.0), sample(2.1, 21.0)]).unwrap();
        assert_eq!(buf.snapshot().channel(0), vec![20.0, 21.0]);
    }
    #[test]
    fn invalid_rate_is_rejected() {
        assert!(matches!(
            SlidingWindowBuffer::with_window_seconds(vec![], 0.0, 1.0),
            Err(PipelineError::InvalidSampleRate)
        ));
    }
}
