// src/stream/network.rs
// 通过 Lab Streaming Layer 发布和订阅指标流
// liblsl 的句柄只在各自的工作线程里创建和使用，对外只暴露通道
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use lsl::{ChannelFormat, ExPushable, Pullable, StreamInfo, StreamInlet, StreamOutlet};

use crate::drivers::PipelineError;
use crate::stream::{MetricInlet, MetricOutlet, MetricSample, StreamContent};
use crate::worker::{spawn_worker, StopSignal, WorkerHandle};

const OUTLET_POLL: Duration = Duration::from_millis(100);
const PULL_TIMEOUT_SECS: f64 = 0.1;
const READ_RETRY: Duration = Duration::from_millis(500);
// 数秒的积压足够覆盖阶段切换
const MAX_BUFFERED_SECS: i32 = 10;

fn lsl_error(err: lsl::Error) -> PipelineError {
    PipelineError::Stream(format!("{err:?}"))
}

/// Maps outlet timestamps back to sequence numbers. The outlet stamps sample
/// `seq` at `origin + seq / rate`, so a missing number shows up as a jump.
#[derive(Clone, Debug)]
pub struct SequenceClock {
    rate_hz: f64,
    origin: Option<f64>,
}
impl SequenceClock {
    pub fn new(rate_hz: f64) -> Self {
        Self {
            rate_hz,
            origin: None,
        }
    }
    pub fn stamp(origin: f64, seq: u64, rate_hz: f64) -> f64 {
        origin + seq as f64 / rate_hz
    }
    /// Sequence number of `timestamp`, counted from the first sample seen.
    pub fn seq(&mut self, timestamp: f64) -> u64 {
        let origin = match self.origin {
            Some(origin) if timestamp >= origin => origin,
            _ => {
                self.origin = Some(timestamp);
                timestamp
            }
        };
        ((timestamp - origin) * self.rate_hz).round() as u64
    }
}

/// Publishes the metric as a float32 LSL stream of one or two channels.
pub struct LslOutlet {
    tx: Sender<MetricSample>,
    _writer: WorkerHandle<()>,
}
impl LslOutlet {
    /// Opens the outlet `name` at the analysis rate; returns once it is visible.
    pub fn open(name: &str, content: StreamContent, rate_hz: f64) -> Result<Self, PipelineError> {
        let (tx, rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let writer = {
            let name = name.to_string();
            spawn_worker("lsl-outlet", move |stop| {
                write_stream(&name, content, rate_hz, &rx, &ready_tx, &stop)
            })?
        };
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                tx,
                _writer: writer,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(PipelineError::StreamUnavailable(name.to_string())),
        }
    }
}
impl MetricOutlet for LslOutlet {
    fn push_sample(&self, sample: &MetricSample) -> Result<(), PipelineError> {
        self.tx
            .send(sample.clone())
            .map_err(|_| PipelineError::Stream("outlet thread has exited".into()))
    }
}

fn open_outlet(name: &str, content: StreamContent, rate_hz: f64) -> Result<StreamOutlet, PipelineError> {
    let info = StreamInfo::new(
        name,
        content.stream_type(),
        content.channels(),
        rate_hz,
        ChannelFormat::Float32,
        &format!("alpha-feedback-{name}"),
    )
    .map_err(lsl_error)?;
    StreamOutlet::new(&info, 0, MAX_BUFFERED_SECS).map_err(lsl_error)
}

fn write_stream(
    name: &str,
    content: StreamContent,
    rate_hz: f64,
    samples: &Receiver<MetricSample>,
    ready: &Sender<Result<(), PipelineError>>,
    stop: &StopSignal,
) {
    let outlet = match open_outlet(name, content, rate_hz) {
        Ok(outlet) => outlet,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    let origin = lsl::local_clock();
    info!(
        "publishing LSL stream '{name}' ({}, {} channels, {rate_hz} Hz)",
        content.stream_type(),
        content.channels()
    );
    let _ = ready.send(Ok(()));
    let mut had_consumers = false;
    while !stop.is_stopped() {
        match samples.recv_timeout(OUTLET_POLL) {
            Ok(sample) => {
                let stamp = SequenceClock::stamp(origin, sample.seq, rate_hz);
                if let Err(err) = outlet.push_sample_ex(&sample.values, stamp, true) {
                    warn!("LSL push failed: {err:?}");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        let consumers = outlet.have_consumers();
        if consumers != had_consumers {
            info!("stream '{name}' {}", if consumers { "has consumers" } else { "lost its consumers" });
            had_consumers = consumers;
        }
    }
    debug!("outlet '{name}' closed");
}

/// Subscription to a named LSL stream. The inlet recovers by itself when the
/// outlet restarts.
pub struct LslInlet {
    content: StreamContent,
    rx: Receiver<MetricSample>,
    _reader: WorkerHandle<()>,
}
impl LslInlet {
    /// Resolves `name` with `timeout` per attempt, warning after each miss,
    /// until it is found or `abort` says to give up (`Ok(None)`).
    pub fn resolve_with_retry(
        name: &str,
        timeout: Duration,
        mut abort: impl FnMut() -> bool,
    ) -> Result<Option<Self>, PipelineError> {
        let (found_tx, found_rx) = bounded(1);
        let (sample_tx, sample_rx) = unbounded();
        let reader = {
            let name = name.to_string();
            spawn_worker("lsl-inlet", move |stop| {
                read_stream(&name, timeout, &found_tx, &sample_tx, &stop)
            })?
        };
        loop {
            match found_rx.recv_timeout(timeout) {
                Ok(Ok(content)) => {
                    return Ok(Some(Self {
                        content,
                        rx: sample_rx,
                        _reader: reader,
                    }))
                }
                Ok(Err(err)) => return Err(err),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("stream '{name}' not found; is the analyser running? retrying");
                    if abort() {
                        return Ok(None);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PipelineError::StreamUnavailable(name.to_string()))
                }
            }
        }
    }
}
impl MetricInlet for LslInlet {
    fn content(&self) -> StreamContent {
        self.content
    }
    fn pull_sample(&mut self, timeout: Duration) -> Result<Option<MetricSample>, PipelineError> {
        match self.rx.recv_timeout(timeout) {
            Ok(sample) => Ok(Some(sample)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(PipelineError::Stream("inlet thread has exited".into()))
            }
        }
    }
    fn drain(&mut self) -> usize {
        self.rx.try_iter().count()
    }
}

fn open_inlet(info: &StreamInfo, timeout: f64) -> Result<(StreamInlet, StreamContent), PipelineError> {
    let stream_type = info.stream_type();
    let content = StreamContent::from_stream_type(&stream_type)
        .ok_or_else(|| PipelineError::Stream(format!("unknown stream type '{stream_type}'")))?;
    if info.channel_count() != content.channels() as i32 {
        return Err(PipelineError::MalformedSample(info.channel_count().max(0) as usize));
    }
    let inlet = StreamInlet::new(info, MAX_BUFFERED_SECS, 0, true).map_err(lsl_error)?;
    inlet.open_stream(timeout).map_err(lsl_error)?;
    Ok((inlet, content))
}

fn read_stream(
    name: &str,
    timeout: Duration,
    found: &Sender<Result<StreamContent, PipelineError>>,
    samples: &Sender<MetricSample>,
    stop: &StopSignal,
) {
    let wait = timeout.as_secs_f64();
    let info = loop {
        if stop.is_stopped() {
            return;
        }
        match lsl::resolve_byprop("name", name, 1, wait) {
            Ok(streams) => {
                if let Some(info) = streams.into_iter().next() {
                    break info;
                }
            }
            Err(err) => debug!("resolving '{name}' failed: {err:?}"),
        }
    };
    let (inlet, content) = match open_inlet(&info, wait) {
        Ok(opened) => opened,
        Err(err) => {
            let _ = found.send(Err(err));
            return;
        }
    };
    let mut clock = SequenceClock::new(info.nominal_srate());
    info!(
        "subscribed to '{name}' ({}, {} Hz)",
        content.stream_type(),
        info.nominal_srate()
    );
    let _ = found.send(Ok(content));
    while !stop.is_stopped() {
        let pulled: Result<(Vec<f32>, f64), _> = inlet.pull_sample(PULL_TIMEOUT_SECS);
        match pulled {
            Ok((values, timestamp)) if !values.is_empty() && timestamp != 0.0 => {
                let sample = MetricSample {
                    seq: clock.seq(timestamp),
                    timestamp,
                    values,
                };
                if samples.send(sample).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!("LSL read from '{name}' failed: {err:?}");
                if stop.wait_timeout(READ_RETRY) {
                    break;
                }
            }
        }
    }
    debug!("inlet '{name}' closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::FeedbackMode;
    use std::time::Instant;
    #[test]
    fn sequence_survives_the_timestamp_round_trip() {
        let origin = 12_345.678;
        let mut clock = SequenceClock::new(10.0);
        let seqs: Vec<u64> = [40, 41, 44, 45]
            .into_iter()
            .map(|seq| clock.seq(SequenceClock::stamp(origin, seq, 10.0)))
            .collect();
        // counted from the first sample, holes preserved
        assert_eq!(seqs, vec![0, 1, 4, 5]);
    }
    #[test]
    fn earlier_timestamp_restarts_the_count() {
        let mut clock = SequenceClock::new(10.0);
        assert_eq!(clock.seq(100.0), 0);
        assert_eq!(clock.seq(100.3), 3);
        assert_eq!(clock.seq(50.0), 0);
        assert_eq!(clock.seq(50.1), 1);
    }
    #[test]
    #[ignore = "needs liblsl and a network that allows stream discovery"]
    fn subscriber_receives_published_samples() {
        let content = StreamContent::Metric(FeedbackMode::Asymmetry);
        let outlet = LslOutlet::open("alpha-feedback-test", content, 10.0).unwrap();
        let mut inlet = LslInlet::resolve_with_retry("alpha-feedback-test", Duration::from_secs(3), || true)
            .unwrap()
            .unwrap();
        assert_eq!(inlet.content(), content);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut got = None;
        let mut seq = 0;
        while got.is_none() && Instant::now() < deadline {
            outlet.push_sample(&MetricSample::scalar(seq, 0.0, 0.5)).unwrap();
            seq += 1;
            got = inlet.pull_sample(Duration::from_millis(100)).unwrap();
        }
        assert_eq!(got.unwrap().values, vec![0.5]);
    }
}
