use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::drivers::PipelineError;
use crate::stream::{MetricInlet, MetricOutlet, MetricSample, StreamContent};

/// In-process fan-out, used when acquisition and feedback share a process.
pub struct LocalHub {
    content: StreamContent,
    subscribers: Mutex<Vec<Sender<MetricSample>>>,
}
impl LocalHub {
    pub fn new(content: StreamContent) -> Self {
        Self {
            content,
            subscribers: Mutex::new(Vec::new()),
        }
    }
    pub fn subscribe(&self) -> LocalInlet {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        LocalInlet {
            content: self.content,
            rx,
        }
    }
}
impl MetricOutlet for LocalHub {
    fn push_sample(&self, sample: &MetricSample) -> Result<(), PipelineError> {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // dropped inlets disconnect their sender
        subscribers.retain(|tx| tx.send(sample.clone()).is_ok());
        Ok(())
    }
}

pub struct LocalInlet {
    content: StreamContent,
    rx: Receiver<MetricSample>,
}
impl MetricInlet for LocalInlet {
    fn content(&self) -> StreamContent {
        self.content
    }
    fn pull_sample(&mut self, timeout: Duration) -> Result<Option<MetricSample>, PipelineError> {
        match self.rx.recv_timeout(timeout) {
            Ok(sample) => Ok(Some(sample)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(PipelineError::StreamUnavailable("local hub dropped".into()))
            }
        }
    }
    fn drain(&mut self) -> usize {
        self.rx.try_iter().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn late_subscriber_sees_only_later_samples() {
        let hub = LocalHub::new(StreamContent::Powers);
        let mut early = hub.subscribe();
        for seq in 0..5 {
            hub.push_sample(&MetricSample::scalar(seq, seq as f64, 0.0)).unwrap();
        }
        let mut late = hub.subscribe();
        hub.push_sample(&MetricSample::scalar(5, 5.0, 0.0)).unwrap();
        let first = late.pull_sample(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(first.seq, 5);
        assert!(late.pull_sample(Duration::from_millis(10)).unwrap().is_none());
        assert_eq!(early.drain(), 6);
    }
    #[test]
    fn dropped_inlets_are_pruned() {
        let hub = LocalHub::new(StreamContent::Powers);
        let inlet = hub.subscribe();
        let _kept = hub.subscribe();
        drop(inlet);
        hub.push_sample(&MetricSample::scalar(0, 0.0, 1.0)).unwrap();
        assert_eq!(hub.subscribers.lock().unwrap().len(), 1);
    }
    #[test]
    fn drain_discards_backlog() {
        let hub = LocalHub::new(StreamContent::Powers);
        let mut inlet = hub.subscribe();
        for seq in 0..3 {
            hub.push_sample(&MetricSample::scalar(seq, 0.0, 0.0)).unwrap();
        }
        assert_eq!(inlet.drain(), 3);
        assert!(inlet.pull_sample(Duration::from_millis(1)).unwrap().is_none());
    }
}
