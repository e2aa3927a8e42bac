// src/session.rs
// 反馈会话：标定 -> 若干反馈块 -> 静息 alpha -> 统计
// 会话状态按值在各阶段之间传递，每个阶段开始前重新订阅 (清空积压)
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::StudyConfig;
use crate::drivers::{
    BarGeometry, CalibrationEngine, CalibrationOutcome, CalibrationRatio, CalibrationResult,
    FeedbackMode, LevelScaler, PipelineError,
};
use crate::operator::OperatorConsole;
use crate::recorder::{
    self, block_path, discover_replay_sources, load_replay_session, RecordedRow, ReplayCursor,
    ReplaySession,
};
use crate::stats::{SummaryStats, ThresholdStats};
use crate::stream::MetricInlet;
use crate::subject::{assignment, heading, note, SubjectProfile, SubjectRecord};
use crate::types::{trigger, Condition, FeedbackDisplay, LevelCell, OperatorCommand, TriggerPort};
use crate::worker::{spawn_worker, StopSignal, WorkerHandle};

/// Timing and display constants for one session, with subject overrides applied.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub records_dir: PathBuf,
    pub calibration: Duration,
    pub block: Duration,
    pub block_count: usize,
    pub rest: Duration,
    pub resting_alpha: Duration,
    pub countdown_seconds: u64,
    pub frame: Duration,
    pub zero_screen_pos: f64,
    pub bar_min_length: f64,
    pub ratio: CalibrationRatio,
    pub threshold: f64,
    pub replay_min_blocks: usize,
    /// Silence on the level stream after which the bar goes blank.
    pub stall_timeout: Duration,
}

pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(3);

impl SessionSettings {
    pub fn from_study(study: &StudyConfig, profile: &SubjectProfile) -> Self {
        let mut settings = Self {
            records_dir: study.records_dir.clone(),
            calibration: study.calibration(),
            block: study.block(),
            block_count: study.block_count,
            rest: study.rest(),
            resting_alpha: study.resting_alpha(),
            countdown_seconds: study.countdown_seconds,
            frame: Duration::from_millis(study.frame_ms.max(1)),
            zero_screen_pos: study.zero_screen_pos,
            bar_min_length: study.bar_min_length,
            ratio: study.calibration_ratio(),
            threshold: study.threshold,
            replay_min_blocks: study.replay_min_blocks,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        };
        // 被试文件里的设置优先
        if let Some(minutes) = profile.calibration_minutes.filter(|m| *m >= 0.0) {
            info!("subject override: calibration {minutes} min");
            settings.calibration = Duration::from_secs_f64(minutes * 60.0);
        }
        if let Some(minutes) = profile.block_minutes.filter(|m| *m > 0.0) {
            info!("subject override: block {minutes} min");
            settings.block = Duration::from_secs_f64(minutes * 60.0);
        }
        if let Some(count) = profile.block_count.filter(|c| *c > 0) {
            info!("subject override: {count} blocks");
            settings.block_count = count;
        }
        settings
    }
}

/// Levels and raw rows collected during one block.
#[derive(Clone, Debug, Default)]
pub struct BlockHistory {
    pub index: usize,
    pub levels: Vec<f64>,
    pub rows: Vec<RecordedRow>,
    pub gaps: u64,
}

#[derive(Clone, Debug)]
pub struct SessionState {
    pub subject: String,
    pub session_number: u32,
    pub condition: Condition,
    pub calibration: CalibrationResult,
    pub replay: Option<ReplaySession>,
    pub blocks: Vec<BlockHistory>,
}

impl SessionState {
    pub fn mode(&self) -> FeedbackMode {
        self.condition.metric_mode()
    }
    pub fn levels(&self) -> Vec<f64> {
        self.blocks.iter().flat_map(|b| b.levels.iter().copied()).collect()
    }
    pub fn gaps(&self) -> u64 {
        self.blocks.iter().map(|b| b.gaps).sum()
    }
}

/// Condition for `session_number` (1-based); past the end of the group it is Asymmetry.
pub fn choose_condition(group: Option<&str>, session_number: u32) -> Condition {
    let index = session_number.max(1) as usize - 1;
    match group.and_then(|g| g.chars().nth(index)) {
        Some(code) => Condition::from_code(code).unwrap_or_else(|| {
            warn!("unknown condition code '{code}' in group; using asymmetry");
            Condition::Asymmetry
        }),
        None => {
            info!("session {session_number} lies beyond the subject's group; using asymmetry");
            Condition::Asymmetry
        }
    }
}

pub fn assign_group<R: Rng + ?Sized>(groups: &[String], rng: &mut R) -> Option<String> {
    groups.choose(rng).cloned()
}

/// Picks a random recorded session from another subject; `None` when none qualifies.
pub fn pick_replay<R: Rng + ?Sized>(
    settings: &SessionSettings,
    subject: &str,
    rng: &mut R,
) -> Option<ReplaySession> {
    let sources = match discover_replay_sources(&settings.records_dir, settings.replay_min_blocks, subject) {
        Ok(sources) => sources,
        Err(err) => {
            warn!("cannot scan {}: {err}", settings.records_dir.display());
            return None;
        }
    };
    let source = sources.choose(rng)?.clone();
    match load_replay_session(&settings.records_dir, source) {
        Ok(session) => Some(session),
        Err(err) => {
            warn!("replay record unusable: {err}");
            None
        }
    }
}

/// Builds the starting state from a subject record.
pub fn prepare_state<R: Rng + ?Sized>(
    subject: &str,
    profile: &SubjectProfile,
    settings: &SessionSettings,
    rng: &mut R,
) -> SessionState {
    let session_number = profile.session_number();
    let mut condition = choose_condition(profile.group.as_deref(), session_number);
    let mut calibration = match (profile.zero_point, profile.spread_scale) {
        (Some(zero), Some(scale)) => CalibrationResult::restored(zero, scale),
        (Some(zero), None) => CalibrationResult::restored(zero, crate::drivers::DEFAULT_SPREAD_SCALE),
        _ => CalibrationResult::default(),
    };
    let mut replay = None;
    if condition == Condition::Replay {
        match pick_replay(settings, subject, rng) {
            Some(session) => {
                info!(
                    "replaying {} session {} ({} blocks)",
                    session.source.subject,
                    session.source.session,
                    session.blocks.len()
                );
                calibration = session.calibration;
                replay = Some(session);
            }
            None => {
                warn!("no recording available for replay; falling back to asymmetry feedback");
                condition = Condition::Asymmetry;
            }
        }
    }
    SessionState {
        subject: subject.to_string(),
        session_number,
        condition,
        calibration,
        replay,
        blocks: Vec::new(),
    }
}

/// What the session ended with.
#[derive(Clone, Debug)]
pub struct SessionReport {
    pub session_number: u32,
    pub condition: Condition,
    pub calibration: CalibrationResult,
    pub blocks_completed: usize,
    pub summary: Option<SummaryStats>,
    pub threshold: ThresholdStats,
    pub gaps: u64,
    pub quit_early: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Next,
    Quit,
}

/// How a timed collection phase ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PhaseEnd {
    Elapsed,
    Skipped,
    Quit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockFlow {
    Completed,
    Restart,
    Quit,
}

/// Everything the level consumer collected between start and stop.
#[derive(Debug, Default)]
struct Collected {
    levels: Vec<f64>,
    rows: Vec<RecordedRow>,
    gaps: u64,
}

struct ConsumerOutput {
    inlet: Box<dyn MetricInlet>,
    collected: Collected,
}

const CONSUMER_POLL: Duration = Duration::from_millis(50);
const CONSUMER_RETRY: Duration = Duration::from_millis(200);

fn consume(
    mut inlet: Box<dyn MetricInlet>,
    mode: FeedbackMode,
    level: Arc<LevelCell>,
    stall_timeout: Duration,
    stop: StopSignal,
) -> ConsumerOutput {
    let mut collected = Collected::default();
    let mut last_seq: Option<u64> = None;
    let mut last_arrival = Instant::now();
    let mut stalled = false;
    while !stop.is_stopped() {
        let sample = match inlet.pull_sample(CONSUMER_POLL) {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                let silent = last_arrival.elapsed();
                if !stalled && silent >= stall_timeout {
                    // 不显示过期的水平
                    warn!("no level samples for {silent:?}; feedback blanked until the stream returns");
                    level.store(f64::NAN);
                    stalled = true;
                }
                continue;
            }
            Err(err) => {
                warn!("level stream: {err}");
                if stop.wait_timeout(CONSUMER_RETRY) {
                    break;
                }
                continue;
            }
        };
        last_arrival = Instant::now();
        if stalled {
            info!("level stream is back");
            stalled = false;
        }
        if let Some(prev) = last_seq {
            if sample.seq > prev + 1 {
                collected.gaps += sample.seq - prev - 1;
            }
        }
        last_seq = Some(sample.seq);
        match sample.metric(mode) {
            Ok(value) => {
                level.store(value);
                collected.levels.push(value);
                collected.rows.push(match sample.power_pair() {
                    Some((left, right)) => RecordedRow::Powers { left, right },
                    None => RecordedRow::Level(value),
                });
            }
            Err(err) => {
                collected.gaps += 1;
                debug!("unusable sample {}: {err}", sample.seq);
            }
        }
    }
    ConsumerOutput { inlet, collected }
}

/// Drives one session against a level stream, a trigger port and a display.
pub struct Session<T: TriggerPort, D: FeedbackDisplay> {
    settings: SessionSettings,
    record: SubjectRecord,
    inlet: Option<Box<dyn MetricInlet>>,
    triggers: T,
    display: D,
    operator: OperatorConsole,
    level: Arc<LevelCell>,
}

impl<T: TriggerPort, D: FeedbackDisplay> Session<T, D> {
    pub fn new(
        settings: SessionSettings,
        record: SubjectRecord,
        inlet: Box<dyn MetricInlet>,
        triggers: T,
        display: D,
        operator: OperatorConsole,
    ) -> Self {
        Self {
            settings,
            record,
            inlet: Some(inlet),
            triggers,
            display,
            operator,
            level: Arc::new(LevelCell::new(f64::NAN)),
        }
    }

    pub fn triggers(&self) -> &T {
        &self.triggers
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn run(&mut self, state: SessionState) -> Result<SessionReport, PipelineError> {
        if let Some(inlet) = &self.inlet {
            let content = inlet.content();
            if !content.serves(state.mode()) {
                return Err(PipelineError::StreamContentMismatch {
                    carried: content.stream_type().to_string(),
                    needed: state.mode(),
                });
            }
        }
        self.write_record("session start", &self.session_header(&state));
        let (state, flow) = self.calibrate(state)?;
        let (state, flow) = match flow {
            Flow::Next => self.run_blocks(state)?,
            Flow::Quit => (state, Flow::Quit),
        };
        if flow == Flow::Next {
            self.resting_alpha();
        }
        Ok(self.summarize(state, flow == Flow::Quit))
    }

    fn session_header(&self, state: &SessionState) -> String {
        let mut text = heading(&format!("start of session {}", state.session_number));
        text += &note("condition", state.condition.code());
        text += &note("calibration_seconds", self.settings.calibration.as_secs_f64());
        text += &note("block_count", self.settings.block_count);
        text += &note("block_seconds", self.settings.block.as_secs_f64());
        if let Some(replay) = &state.replay {
            text += &note(
                "replay_source",
                format!("{}.{}", replay.source.subject, replay.source.session),
            );
        }
        text
    }

    fn write_record(&self, section: &str, text: &str) {
        // 写失败不终止会话，数据仍在内存里
        if let Err(err) = self.record.append(section, text) {
            error!("could not write {section} to {}: {err}", self.record.path().display());
        }
    }

    /// Sleeps in frame steps until `duration` passes or the operator acts.
    fn wait(&self, duration: Duration) -> Option<OperatorCommand> {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(self.settings.frame.min(deadline - now));
            if let Some(command) = self.operator.poll() {
                return Some(command);
            }
        }
    }

    /// Waits out a collection phase. Only `Continue` and `Quit` end it early.
    fn wait_phase(&self, duration: Duration, phase: &str) -> PhaseEnd {
        let deadline = Instant::now() + duration;
        loop {
            match self.wait(deadline.saturating_duration_since(Instant::now())) {
                None => return PhaseEnd::Elapsed,
                Some(OperatorCommand::Continue) => return PhaseEnd::Skipped,
                Some(OperatorCommand::Quit) => return PhaseEnd::Quit,
                Some(OperatorCommand::RestartBlock) => info!("restart has no effect during {phase}"),
            }
        }
    }

    fn countdown(&mut self, what: &str) -> Flow {
        for k in (1..=self.settings.countdown_seconds).rev() {
            self.display.show_message(&format!("{what} starts in {k}."));
            if self.wait(Duration::from_secs(1)) == Some(OperatorCommand::Quit) {
                return Flow::Quit;
            }
        }
        Flow::Next
    }

    fn start_consumer(&mut self, mode: FeedbackMode) -> Result<WorkerHandle<ConsumerOutput>, PipelineError> {
        let mut inlet = self
            .inlet
            .take()
            .ok_or_else(|| PipelineError::StreamUnavailable("level stream lost".into()))?;
        let stale = inlet.drain();
        if stale > 0 {
            debug!("discarded {stale} queued samples");
        }
        self.level.store(f64::NAN);
        let level = Arc::clone(&self.level);
        let stall_timeout = self.settings.stall_timeout;
        Ok(spawn_worker("levels", move |stop| {
            consume(inlet, mode, level, stall_timeout, stop)
        })?)
    }

    /// Joins the consumer and takes the inlet back for the next phase.
    fn stop_consumer(&mut self, consumer: WorkerHandle<ConsumerOutput>) -> Result<Collected, PipelineError> {
        let ConsumerOutput { inlet, collected } = consumer
            .stop()
            .ok_or_else(|| PipelineError::StreamUnavailable("level consumer panicked".into()))?;
        self.inlet = Some(inlet);
        Ok(collected)
    }

    /// Collects the metric for the calibration time, then an eyes-closed
    /// baseline whose statistics are only recorded.
    fn calibrate(&mut self, mut state: SessionState) -> Result<(SessionState, Flow), PipelineError> {
        if self.countdown("Calibration") == Flow::Quit {
            return Ok((state, Flow::Quit));
        }
        self.display
            .show_message("Please look at the cross in the centre and try not to move.");
        self.triggers.send(trigger::CALIBRATION_START);
        let consumer = self.start_consumer(state.mode())?;
        let end = self.wait_phase(self.settings.calibration, "calibration");
        let output = self.stop_consumer(consumer)?;
        self.triggers.send(trigger::CALIBRATION_END);

        let mut engine = CalibrationEngine::new(self.settings.ratio);
        engine.extend(output.levels.iter().copied());
        let gaps = output.gaps + engine.rejected() as u64;
        let outcome = match end {
            PhaseEnd::Elapsed => engine.complete(state.calibration),
            PhaseEnd::Skipped => {
                warn!("calibration aborted by operator; previous parameters kept");
                engine.abort(state.calibration)
            }
            PhaseEnd::Quit => return Ok((state, Flow::Quit)),
        };
        if let CalibrationOutcome::Computed(result) = outcome {
            let mut text = note("calibration_mean", result.mean);
            text += &note("calibration_std", result.std_dev);
            text += &note("calibration_samples", result.sample_count);
            text += &note("calibration_gaps", gaps);
            if state.condition == Condition::Replay {
                // 回放会话沿用回放记录的标定
                info!("replay session: keeping the replayed calibration");
            } else {
                state.calibration = result;
            }
            text += &assignment("zero_point", state.calibration.zero_point);
            text += &assignment("spread_scale", state.calibration.spread_scale);
            self.write_record("calibration", &text);
        }

        self.display.show_message("Now close your eyes and relax.");
        self.triggers.send(trigger::CALIBRATION_EYES_CLOSED);
        let consumer = self.start_consumer(state.mode())?;
        let end = self.wait_phase(self.settings.calibration, "the eyes-closed baseline");
        let output = self.stop_consumer(consumer)?;
        self.triggers.send(trigger::CALIBRATION_END);
        if end == PhaseEnd::Skipped {
            info!("eyes-closed baseline shortened");
        }
        if let Some(stats) = SummaryStats::from_values(&output.levels) {
            let mut text = note("eyes_closed_mean", stats.mean);
            text += &note("eyes_closed_std", stats.std_dev);
            text += &note("eyes_closed_gaps", output.gaps);
            self.write_record("eyes-closed baseline", &text);
        }
        let flow = if end == PhaseEnd::Quit {
            Flow::Quit
        } else {
            Flow::Next
        };
        Ok((state, flow))
    }

    fn run_blocks(&mut self, mut state: SessionState) -> Result<(SessionState, Flow), PipelineError> {
        let mut index = 1;
        while index <= self.settings.block_count {
            let (next, flow) = self.run_block(state, index)?;
            state = next;
            match flow {
                BlockFlow::Completed => index += 1,
                BlockFlow::Restart => info!("restarting block {index}"),
                BlockFlow::Quit => return Ok((state, Flow::Quit)),
            }
        }
        Ok((state, Flow::Next))
    }

    fn run_block(&mut self, mut state: SessionState, index: usize) -> Result<(SessionState, BlockFlow), PipelineError> {
        let count = self.settings.block_count;
        self.triggers.send(trigger::REST);
        self.display.show_message(&format!(
            "Time for a short break. {} of {count} blocks to go.",
            count + 1 - index
        ));
        if self.wait(self.settings.rest) == Some(OperatorCommand::Quit) {
            return Ok((state, BlockFlow::Quit));
        }
        if self.countdown(&format!("Block {index}/{count}")) == Flow::Quit {
            return Ok((state, BlockFlow::Quit));
        }

        self.triggers.send(trigger::BLOCK_START);
        let consumer = self.start_consumer(state.mode())?;
        let scaler = LevelScaler::new(&state.calibration, self.settings.zero_screen_pos);
        let mut cursor = state.replay.as_ref().map(|session| ReplayCursor::new(session, index));
        let deadline = Instant::now() + self.settings.block;
        let mut flow = BlockFlow::Completed;
        while Instant::now() < deadline {
            let raw = match cursor.as_mut() {
                Some(cursor) => cursor.next_frame().unwrap_or(f64::NAN),
                None => self.level.load(),
            };
            let level = scaler.scale(raw);
            let bar = BarGeometry::from_level(level, self.settings.zero_screen_pos, self.settings.bar_min_length);
            self.display.show_bar(bar, level);
            self.triggers.send(trigger::LEVEL_UPDATE);
            thread::sleep(self.settings.frame);
            match self.operator.poll() {
                Some(OperatorCommand::Continue) => {
                    info!("block {index} ended early by operator");
                    break;
                }
                Some(OperatorCommand::RestartBlock) => {
                    flow = BlockFlow::Restart;
                    break;
                }
                Some(OperatorCommand::Quit) => {
                    flow = BlockFlow::Quit;
                    break;
                }
                None => {}
            }
        }
        let output = self.stop_consumer(consumer)?;
        self.display.hide_bar();

        if flow == BlockFlow::Restart {
            warn!("block {index}: {} samples discarded", output.levels.len());
            return Ok((state, flow));
        }
        info!(
            "block {index}: {} samples, {} gaps",
            output.levels.len(),
            output.gaps
        );
        if state.condition != Condition::Replay {
            let path = block_path(
                &self.settings.records_dir,
                &state.subject,
                state.session_number,
                index,
                state.condition.record_extension(),
            );
            if let Err(err) = recorder::write_block(&path, &state.calibration, &output.rows) {
                error!("could not save block {index} to {}: {err}", path.display());
            }
        }
        let mut text = note("block", index);
        text += &note("block_samples", output.levels.len());
        text += &note("block_gaps", output.gaps);
        self.write_record(&format!("block {index}"), &text);
        state.blocks.push(BlockHistory {
            index,
            levels: output.levels,
            rows: output.rows,
            gaps: output.gaps,
        });
        Ok((state, flow))
    }

    /// Eyes-open then eyes-closed resting recording, each skippable.
    fn resting_alpha(&mut self) {
        let phases = [
            (
                "Almost done. Relax and look at the centre of the screen.",
                trigger::RESTING_EYES_OPEN,
            ),
            ("Last one: close your eyes and relax.", trigger::RESTING_EYES_CLOSED),
        ];
        for (message, code) in phases {
            self.display.show_message(message);
            self.triggers.send(code);
            let end = self.wait_phase(self.settings.resting_alpha, "resting alpha");
            self.triggers.send(trigger::RESTING_END);
            match end {
                PhaseEnd::Skipped => info!("resting alpha shortened"),
                PhaseEnd::Quit => return,
                PhaseEnd::Elapsed => {}
            }
        }
    }

    fn summarize(&mut self, state: SessionState, quit_early: bool) -> SessionReport {
        self.display.show_message("That's the end. Thank you for taking part!");
        let levels = state.levels();
        let summary = SummaryStats::from_values(&levels);
        let threshold = ThresholdStats::compute(&levels, self.settings.threshold);
        let gaps = state.gaps();

        let mut text = String::from("### session statistics\n");
        match &summary {
            Some(stats) => {
                text += &note("mean_level", stats.mean);
                text += &note("min_level", stats.min);
                text += &note("max_level", stats.max);
                text += &note("std_level", stats.std_dev);
            }
            None => {
                warn!("no levels recorded this session");
                text += &note("levels", "none");
            }
        }
        text += &note("threshold", threshold.threshold);
        text += &note("samples_at_or_above_threshold", threshold.above);
        text += &note("percent_at_or_above_threshold", format!("{:.2}%", threshold.above_percent()));
        match (threshold.first_crossing, threshold.first_crossing_percent()) {
            (Some(index), Some(percent)) => {
                text += &note("first_crossing", index);
                text += &note("first_crossing_percent", format!("{percent:.2}%"));
            }
            _ => text += &note("first_crossing", "never"),
        }
        text += &note("gaps", gaps);
        if quit_early {
            text += &note("ended", "operator quit");
        }
        text += &heading(&format!("end of session {}", state.session_number));
        text += &assignment("session_number", state.session_number + 1);
        self.write_record("session summary", &text);

        if let Some(stats) = &summary {
            info!(
                "session {} ({:?}): mean {:.4}, min {:.4}, max {:.4}, sd {:.4}, {:.1}% at or above {}",
                state.session_number,
                state.condition,
                stats.mean,
                stats.min,
                stats.max,
                stats.std_dev,
                threshold.above_percent(),
                threshold.threshold
            );
        }
        SessionReport {
            session_number: state.session_number,
            condition: state.condition,
            calibration: state.calibration,
            blocks_completed: state.blocks.len(),
            summary,
            threshold,
            gaps,
            quit_early,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::CalibrationResult;
    use crate::recorder::write_block;
    use crate::stream::{LocalHub, MetricOutlet, MetricSample, StreamContent};
    use crate::types::{LogDisplay, LogTriggerPort};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn settings(records: &TempDir) -> SessionSettings {
        SessionSettings {
            records_dir: records.path().to_path_buf(),
            calibration: Duration::from_millis(150),
            block: Duration::from_millis(150),
            block_count: 2,
            rest: Duration::ZERO,
            resting_alpha: Duration::ZERO,
            countdown_seconds: 0,
            frame: Duration::from_millis(5),
            zero_screen_pos: -0.6,
            bar_min_length: 0.17,
            ratio: CalibrationRatio::default(),
            threshold: 0.0,
            replay_min_blocks: 5,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    /// Publishes varying power pairs every 2 ms until stopped, numbering them
    /// `0, stride, 2 * stride, ...`.
    fn feeder(hub: Arc<LocalHub>, stride: u64) -> WorkerHandle<()> {
        spawn_worker("feeder", move |stop| {
            let mut seq = 0u64;
            while !stop.wait_timeout(Duration::from_millis(2)) {
                let right = 10f64.powf(0.5 + 0.2 * (seq as f64 * 0.7).sin());
                let _ = hub.push_sample(&MetricSample::powers(seq, seq as f64 * 0.002, 1.0, right));
                seq += stride;
            }
        })
        .unwrap()
    }

    fn spawn_consumer(hub: &LocalHub, level: &Arc<LevelCell>, stall: Duration) -> WorkerHandle<ConsumerOutput> {
        let inlet: Box<dyn MetricInlet> = Box::new(hub.subscribe());
        let level = Arc::clone(level);
        spawn_worker("levels", move |stop| {
            consume(inlet, FeedbackMode::Asymmetry, level, stall, stop)
        })
        .unwrap()
    }

    fn wait_for_level(level: &LevelCell, expected: f64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if (level.load() - expected).abs() < 1e-9 {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn note_values(text: &str, key: &str) -> Vec<u64> {
        let prefix = format!("# {key} = ");
        text.lines()
            .filter_map(|line| line.strip_prefix(prefix.as_str()))
            .map(|value| value.parse().unwrap())
            .collect()
    }

    fn state(subject: &str, condition: Condition) -> SessionState {
        SessionState {
            subject: subject.into(),
            session_number: 1,
            condition,
            calibration: CalibrationResult::default(),
            replay: None,
            blocks: Vec::new(),
        }
    }

    fn session(
        settings: SessionSettings,
        record: SubjectRecord,
        hub: &LocalHub,
        commands: Vec<OperatorCommand>,
    ) -> Session<LogTriggerPort, LogDisplay> {
        Session::new(
            settings,
            record,
            Box::new(hub.subscribe()),
            LogTriggerPort::default(),
            LogDisplay::default(),
            OperatorConsole::scripted(commands),
        )
    }

    #[test]
    fn condition_follows_the_group_string() {
        assert_eq!(choose_condition(Some("AFR"), 1), Condition::Asymmetry);
        assert_eq!(choose_condition(Some("AFR"), 2), Condition::Replay);
        assert_eq!(choose_condition(Some("AFR"), 3), Condition::Relaxation);
        assert_eq!(choose_condition(Some("AFR"), 4), Condition::Asymmetry);
        assert_eq!(choose_condition(None, 1), Condition::Asymmetry);
    }

    #[test]
    fn subject_overrides_win_over_study_defaults() {
        let profile = SubjectProfile {
            block_count: Some(3),
            block_minutes: Some(0.5),
            ..SubjectProfile::default()
        };
        let settings = SessionSettings::from_study(&StudyConfig::default(), &profile);
        assert_eq!(settings.block_count, 3);
        assert_eq!(settings.block, Duration::from_secs(30));
        assert_eq!(settings.calibration, Duration::from_secs(60));
    }

    #[test]
    fn replay_without_recordings_falls_back_to_asymmetry() {
        let records = tempdir().unwrap();
        let profile = SubjectProfile {
            group: Some("F".into()),
            ..SubjectProfile::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let state = prepare_state("JanKowalski", &profile, &settings(&records), &mut rng);
        assert_eq!(state.condition, Condition::Asymmetry);
        assert!(state.replay.is_none());
    }

    #[test]
    fn full_session_writes_blocks_and_advances_the_session() {
        let subjects = tempdir().unwrap();
        let records = tempdir().unwrap();
        let record = SubjectRecord::create(subjects.path(), "JanKowalski", "AAA").unwrap();
        let hub = Arc::new(LocalHub::new(StreamContent::Powers));
        let feed = feeder(Arc::clone(&hub), 1);
        let mut session = session(settings(&records), record.clone(), &hub, vec![]);
        let report = session.run(state("JanKowalski", Condition::Asymmetry)).unwrap();
        feed.stop();

        assert_eq!(report.blocks_completed, 2);
        assert!(!report.quit_early);
        let summary = report.summary.unwrap();
        assert!(summary.count > 0);
        // log10(right) - log10(1) stays within 0.5 +- 0.2
        assert!(summary.mean > 0.2 && summary.mean < 0.8, "{summary:?}");
        assert_eq!(report.threshold.above, summary.count);
        assert!(report.calibration.sample_count > 0);

        let sent = &session.triggers().sent;
        let markers: Vec<u8> = sent.iter().copied().filter(|c| *c != trigger::LEVEL_UPDATE).collect();
        assert_eq!(markers, vec![1, 9, 8, 9, 3, 2, 3, 2, 5, 7, 6, 7]);
        assert!(sent.contains(&trigger::LEVEL_UPDATE));
        assert!(session.display().frames > 0);

        for block in 1..=2 {
            let path = block_path(records.path(), "JanKowalski", 1, block, "alfa");
            let block = recorder::read_block(&path).unwrap();
            assert_eq!(block.zero_point, report.calibration.zero_point);
        }
        let (_, profile) = SubjectRecord::open(record.path()).unwrap();
        assert_eq!(profile.session_number(), 2);
        assert_eq!(profile.zero_point, Some(report.calibration.zero_point));
    }

    #[test]
    fn restart_discards_the_partial_block() {
        let subjects = tempdir().unwrap();
        let records = tempdir().unwrap();
        let record = SubjectRecord::create(subjects.path(), "JanKowalski", "RRR").unwrap();
        let hub = Arc::new(LocalHub::new(StreamContent::Powers));
        let feed = feeder(Arc::clone(&hub), 1);
        let mut settings = settings(&records);
        // no calibration waits, so the first poll happens in block 1
        settings.calibration = Duration::ZERO;
        let commands = vec![OperatorCommand::RestartBlock, OperatorCommand::Continue];
        let mut session = session(settings, record, &hub, commands);
        let report = session.run(state("JanKowalski", Condition::Relaxation)).unwrap();
        feed.stop();

        assert_eq!(report.blocks_completed, 2);
        let starts = session.triggers().sent.iter().filter(|c| **c == trigger::BLOCK_START).count();
        assert_eq!(starts, 3);
        assert!(block_path(records.path(), "JanKowalski", 1, 1, "relaks").exists());
        assert!(block_path(records.path(), "JanKowalski", 1, 2, "relaks").exists());
        assert!(!block_path(records.path(), "JanKowalski", 1, 1, "alfa").exists());
    }

    #[test]
    fn quit_still_writes_the_summary() {
        let subjects = tempdir().unwrap();
        let records = tempdir().unwrap();
        let record = SubjectRecord::create(subjects.path(), "JanKowalski", "A").unwrap();
        let hub = Arc::new(LocalHub::new(StreamContent::Powers));
        let mut settings = settings(&records);
        settings.calibration = Duration::ZERO;
        let mut session = session(settings, record.clone(), &hub, vec![OperatorCommand::Quit]);
        let report = session.run(state("JanKowalski", Condition::Asymmetry)).unwrap();
        assert!(report.quit_early);
        assert_eq!(report.blocks_completed, 1);
        assert!(report.summary.is_none());
        assert!(!session.triggers().sent.contains(&trigger::RESTING_EYES_OPEN));
        let text = fs::read_to_string(record.path()).unwrap();
        assert!(text.contains("# first_crossing = never"));
        assert!(text.contains("session_number = 2"));
    }

    #[test]
    fn replay_session_uses_recorded_levels_and_writes_no_blocks() {
        let subjects = tempdir().unwrap();
        let records = tempdir().unwrap();
        let recorded = CalibrationResult::restored(0.3, 0.02);
        for block in 1..=5 {
            let rows = vec![RecordedRow::Powers { left: 1.0, right: 2.0 }; 4];
            write_block(&block_path(records.path(), "OtherSubject", 1, block, "alfa"), &recorded, &rows).unwrap();
        }
        let record = SubjectRecord::create(subjects.path(), "JanKowalski", "F").unwrap();
        let (_, profile) = SubjectRecord::open(record.path()).unwrap();
        let settings = settings(&records);
        let mut rng = StdRng::seed_from_u64(3);
        let state = prepare_state("JanKowalski", &profile, &settings, &mut rng);
        assert_eq!(state.condition, Condition::Replay);
        assert_eq!(state.calibration.zero_point, 0.3);

        let hub = Arc::new(LocalHub::new(StreamContent::Powers));
        let feed = feeder(Arc::clone(&hub), 1);
        let mut session = session(settings, record, &hub, vec![]);
        let report = session.run(state).unwrap();
        feed.stop();

        assert_eq!(report.condition, Condition::Replay);
        assert_eq!(report.calibration.zero_point, 0.3);
        assert_eq!(report.calibration.spread_scale, 0.02);
        let own_blocks = fs::read_dir(records.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().starts_with("JanKowalski"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(own_blocks, 0);
    }

    #[test]
    fn consumer_counts_missing_and_unusable_samples_as_gaps() {
        let hub = LocalHub::new(StreamContent::Powers);
        let level = Arc::new(LevelCell::new(f64::NAN));
        let consumer = spawn_consumer(&hub, &level, DEFAULT_STALL_TIMEOUT);
        for seq in [0, 1, 4, 5] {
            hub.push_sample(&MetricSample::powers(seq, 0.0, 1.0, 10.0)).unwrap();
        }
        // zero power cannot be turned into a level
        hub.push_sample(&MetricSample::powers(6, 0.0, 0.0, 10.0)).unwrap();
        hub.push_sample(&MetricSample::powers(7, 0.0, 1.0, 1000.0)).unwrap();
        assert!(wait_for_level(&level, 3.0));
        let ConsumerOutput { collected, .. } = consumer.stop().unwrap();
        let expected = [1.0, 1.0, 1.0, 1.0, 3.0];
        assert_eq!(collected.levels.len(), expected.len());
        assert!(collected.levels.iter().zip(expected).all(|(got, want)| (got - want).abs() < 1e-9));
        assert_eq!(collected.rows.len(), 5);
        assert_eq!(collected.gaps, 3);
    }

    #[test]
    fn level_goes_blank_while_the_stream_is_silent() {
        let hub = LocalHub::new(StreamContent::Powers);
        let level = Arc::new(LevelCell::new(f64::NAN));
        let consumer = spawn_consumer(&hub, &level, Duration::from_millis(50));
        hub.push_sample(&MetricSample::powers(0, 0.0, 1.0, 10.0)).unwrap();
        assert!(wait_for_level(&level, 1.0));
        thread::sleep(Duration::from_millis(250));
        assert!(level.load().is_nan());
        hub.push_sample(&MetricSample::powers(1, 0.1, 1.0, 100.0)).unwrap();
        assert!(wait_for_level(&level, 2.0));
        let ConsumerOutput { collected, .. } = consumer.stop().unwrap();
        assert_eq!(collected.levels.len(), 2);
        assert_eq!(collected.gaps, 0);
    }

    #[test]
    fn restart_during_calibration_does_not_cut_it_short() {
        let subjects = tempdir().unwrap();
        let records = tempdir().unwrap();
        let record = SubjectRecord::create(subjects.path(), "JanKowalski", "AAA").unwrap();
        let hub = Arc::new(LocalHub::new(StreamContent::Powers));
        let feed = feeder(Arc::clone(&hub), 1);
        let mut settings = settings(&records);
        settings.calibration = Duration::from_millis(300);
        let mut session = session(settings, record, &hub, vec![OperatorCommand::RestartBlock]);
        let started = Instant::now();
        let report = session.run(state("JanKowalski", Condition::Asymmetry)).unwrap();
        feed.stop();

        // both calibration phases ran to their deadline
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert!(report.calibration.sample_count >= 30, "{:?}", report.calibration);
        // the restart was spent on calibration, not on block 1
        let starts = session.triggers().sent.iter().filter(|c| **c == trigger::BLOCK_START).count();
        assert_eq!(starts, 2);
        assert_eq!(report.blocks_completed, 2);
    }

    #[test]
    fn skipped_calibration_keeps_the_previous_parameters() {
        let subjects = tempdir().unwrap();
        let records = tempdir().unwrap();
        let record = SubjectRecord::create(subjects.path(), "JanKowalski", "AAA").unwrap();
        let hub = Arc::new(LocalHub::new(StreamContent::Powers));
        let feed = feeder(Arc::clone(&hub), 1);
        let mut settings = settings(&records);
        settings.calibration = Duration::from_secs(5);
        let commands = vec![OperatorCommand::Continue, OperatorCommand::Continue];
        let mut session = session(settings, record.clone(), &hub, commands);
        let mut start = state("JanKowalski", Condition::Asymmetry);
        start.calibration = CalibrationResult::restored(0.25, 0.05);
        let report = session.run(start).unwrap();
        feed.stop();

        assert_eq!(report.calibration.zero_point, 0.25);
        assert_eq!(report.calibration.spread_scale, 0.05);
        let text = fs::read_to_string(record.path()).unwrap();
        assert!(!text.contains("calibration_mean"));
    }

    #[test]
    fn gaps_are_written_to_the_subject_record() {
        let subjects = tempdir().unwrap();
        let records = tempdir().unwrap();
        let record = SubjectRecord::create(subjects.path(), "JanKowalski", "AAA").unwrap();
        let hub = Arc::new(LocalHub::new(StreamContent::Powers));
        // every other sequence number goes missing
        let feed = feeder(Arc::clone(&hub), 2);
        let mut session = session(settings(&records), record.clone(), &hub, vec![]);
        let report = session.run(state("JanKowalski", Condition::Asymmetry)).unwrap();
        feed.stop();

        assert!(report.gaps > 0);
        let text = fs::read_to_string(record.path()).unwrap();
        let calibration = note_values(&text, "calibration_gaps");
        assert_eq!(calibration.len(), 1);
        assert!(calibration[0] > 0);
        let blocks = note_values(&text, "block_gaps");
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|gaps| *gaps > 0));
        assert_eq!(blocks.iter().sum::<u64>(), report.gaps);
    }

    #[test]
    fn scalar_stream_of_another_mode_is_refused() {
        let subjects = tempdir().unwrap();
        let records = tempdir().unwrap();
        let record = SubjectRecord::create(subjects.path(), "JanKowalski", "RRR").unwrap();
        let hub = LocalHub::new(StreamContent::Metric(FeedbackMode::Asymmetry));
        let mut session = session(settings(&records), record.clone(), &hub, vec![]);
        let result = session.run(state("JanKowalski", Condition::Relaxation));
        assert!(matches!(
            result,
            Err(PipelineError::StreamContentMismatch {
                needed: FeedbackMode::Relaxation,
                ..
            })
        ));
        assert!(session.triggers().sent.is_empty());
    }
}
