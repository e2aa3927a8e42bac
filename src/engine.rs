// src/engine.rs
// 连续采集循环：采集 -> 滑动窗口 -> 分析线程池 -> 发布
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::drivers::{
    AnalysisPass, FeedbackMode, FrequencyBand, HemisphereMontage, PipelineError, SampleSource,
    SignalPipeline, SlidingWindow,
};
use crate::stream::{MetricOutlet, MetricSample, StreamContent};
use crate::worker::{spawn_worker, StopSignal, WorkerHandle};

/// What goes on the wire each cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishPayload {
    /// `[left, right]` band powers; the consumer derives the metric.
    Powers,
    /// The metric itself.
    Metric,
}

#[derive(Clone, Debug)]
pub struct AcquisitionSettings {
    pub window_seconds: f32,
    pub analysis_rate_hz: f32,
    pub montage: HemisphereMontage,
    pub band: FrequencyBand,
    pub mode: FeedbackMode,
    pub payload: PublishPayload,
    pub workers: usize,
    /// Hold analysis until the first full window is buffered.
    pub wait_for_full_window: bool,
    pub source_retry: Duration,
}
impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            window_seconds: 1.0,
            analysis_rate_hz: 10.0,
            montage: HemisphereMontage::default(),
            band: FrequencyBand::ALPHA,
            mode: FeedbackMode::Asymmetry,
            payload: PublishPayload::Powers,
            workers: 2,
            wait_for_full_window: true,
            source_retry: Duration::from_secs(1),
        }
    }
}
impl AcquisitionSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.analysis_rate_hz)
    }
    /// What subscribers will receive, announced with the stream.
    pub fn content(&self) -> StreamContent {
        match self.payload {
            PublishPayload::Powers => StreamContent::Powers,
            PublishPayload::Metric => StreamContent::Metric(self.mode),
        }
    }
}

/// Counters shared between the loop, the analysers and whoever reports on them.
#[derive(Debug, Default)]
pub struct AcquisitionStats {
    ticks: AtomicU64,
    dispatched: AtomicU64,
    published: AtomicU64,
    skipped: AtomicU64,
    superseded: AtomicU64,
    source_errors: AtomicU64,
}
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub dispatched: u64,
    pub published: u64,
    pub skipped: u64,
    pub superseded: u64,
    pub source_errors: u64,
}
impl AcquisitionStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot queued for analysis, numbered when it was cut.
#[derive(Debug)]
struct AnalysisJob {
    seq: u64,
    window: SlidingWindow,
}

/// Running acquisition loop plus its analysis pool.
pub struct AcquisitionHandle {
    acquisition: WorkerHandle<()>,
    analysers: Vec<WorkerHandle<()>>,
    stats: Arc<AcquisitionStats>,
}
impl AcquisitionHandle {
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
    pub fn is_running(&self) -> bool {
        !self.acquisition.is_finished()
    }
    /// Stops acquisition first so no new window is queued, then the analysers.
    pub fn stop(mut self) -> StatsSnapshot {
        self.acquisition.request_stop();
        for analyser in &mut self.analysers {
            analyser.request_stop();
        }
        self.acquisition.stop();
        for analyser in self.analysers {
            analyser.stop();
        }
        let stats = self.stats.snapshot();
        info!(
            "acquisition stopped: {} ticks, {} published, {} skipped, {} superseded, {} source errors",
            stats.ticks, stats.published, stats.skipped, stats.superseded, stats.source_errors
        );
        stats
    }
}

/// Starts the loop on its own thread. Analysis of window k overlaps the pull of k+1.
pub fn spawn_acquisition<S>(
    source: S,
    outlet: Arc<dyn MetricOutlet>,
    settings: AcquisitionSettings,
) -> Result<AcquisitionHandle, PipelineError>
where
    S: SampleSource + 'static,
{
    if !(settings.analysis_rate_hz > 0.0) {
        return Err(PipelineError::InvalidSampleRate);
    }
    let workers = settings.workers.max(1);
    let pipeline = SignalPipeline::new(source, settings.window_seconds)?;
    let stats = Arc::new(AcquisitionStats::default());
    let last_published = Arc::new(Mutex::new(None));
    // one slot per worker; a full queue means every worker is still busy
    let (job_tx, job_rx) = bounded::<AnalysisJob>(workers);

    let analysers = (0..workers)
        .map(|idx| {
            let ctx = AnalyserContext {
                pass: AnalysisPass::new(settings.montage.clone(), settings.band),
                mode: settings.mode,
                payload: settings.payload,
                jobs: job_rx.clone(),
                outlet: Arc::clone(&outlet),
                stats: Arc::clone(&stats),
                last_published: Arc::clone(&last_published),
            };
            spawn_worker(&format!("analyser-{idx}"), move |stop| ctx.run(&stop))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let acquisition = {
        let stats = Arc::clone(&stats);
        let settings = settings.clone();
        spawn_worker("acquisition", move |stop| {
            acquisition_loop(pipeline, job_tx, job_rx, &settings, &stats, &stop)
        })?
    };
    info!(
        "acquisition started: window {:.2}s, analysis {:.1} Hz, {} analysers, {:?}",
        settings.window_seconds, settings.analysis_rate_hz, workers, settings.mode
    );
    Ok(AcquisitionHandle {
        acquisition,
        analysers,
        stats,
    })
}

fn acquisition_loop<S: SampleSource>(
    mut pipeline: SignalPipeline<S>,
    jobs: Sender<AnalysisJob>,
    stale: Receiver<AnalysisJob>,
    settings: &AcquisitionSettings,
    stats: &AcquisitionStats,
    stop: &StopSignal,
) {
    let tick = settings.tick();
    let mut announced_full = false;
    // every dispatched window takes a number, so lost cycles leave holes downstream
    let mut next_seq = 0u64;
    while !stop.is_stopped() {
        let window = match pipeline.pump_once(tick) {
            Ok(Some(window)) => window,
            Ok(None) => continue,
            Err(err) => {
                AcquisitionStats::bump(&stats.source_errors);
                warn!("sample source error: {err}; retrying in {:?}", settings.source_retry);
                if stop.wait_timeout(settings.source_retry) {
                    break;
                }
                continue;
            }
        };
        AcquisitionStats::bump(&stats.ticks);
        if settings.wait_for_full_window && !pipeline.buffer().is_full() {
            continue;
        }
        if !announced_full {
            info!("window filled ({} samples); analysis running", window.len());
            announced_full = true;
        }
        let job = AnalysisJob { seq: next_seq, window };
        next_seq += 1;
        AcquisitionStats::bump(&stats.dispatched);
        match jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                // freshest wins: evict the oldest pending window
                if let Ok(evicted) = stale.try_recv() {
                    debug!("window {} superseded by {}", evicted.seq, job.seq);
                    AcquisitionStats::bump(&stats.superseded);
                }
                if jobs.try_send(job).is_err() {
                    AcquisitionStats::bump(&stats.superseded);
                }
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
    debug!("acquisition loop exited");
}

struct AnalyserContext {
    pass: AnalysisPass,
    mode: FeedbackMode,
    payload: PublishPayload,
    jobs: Receiver<AnalysisJob>,
    outlet: Arc<dyn MetricOutlet>,
    stats: Arc<AcquisitionStats>,
    /// Highest sequence number pushed; held across the push so arrival order matches it.
    last_published: Arc<Mutex<Option<u64>>>,
}
impl AnalyserContext {
    fn run(self, stop: &StopSignal) {
        while !stop.is_stopped() {
            match self.jobs.recv_timeout(Duration::from_millis(50)) {
                Ok(job) => self.analyse(job),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
    fn analyse(&self, job: AnalysisJob) {
        let AnalysisJob { seq, window } = job;
        let powers = match self.pass.run(&window) {
            Ok(powers) => powers,
            Err(err) => {
                AcquisitionStats::bump(&self.stats.skipped);
                debug!("skipping cycle: {err}");
                return;
            }
        };
        let metric = match powers.metric(self.mode) {
            Ok(metric) => metric,
            Err(err) => {
                AcquisitionStats::bump(&self.stats.skipped);
                warn!("skipping cycle: {err}");
                return;
            }
        };
        let timestamp = window.samples.last().map_or(0.0, |s| s.timestamp);
        let mut last = self
            .last_published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if last.map_or(false, |last| seq <= last) {
            // another analyser already published a fresher window
            AcquisitionStats::bump(&self.stats.superseded);
            return;
        }
        let sample = match self.payload {
            PublishPayload::Powers => MetricSample::powers(seq, timestamp, powers.left, powers.right),
            PublishPayload::Metric => MetricSample::scalar(seq, timestamp, metric),
        };
        *last = Some(seq);
        match self.outlet.push_sample(&sample) {
            Ok(()) => AcquisitionStats::bump(&self.stats.published),
            Err(err) => warn!("publish failed: {err}"),
        }
    }
}
