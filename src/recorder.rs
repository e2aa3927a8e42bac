// src/recorder.rs
// 每个反馈块的记录文件：<被试>.<会话>.<块>.alfa|relaks
// 第一行 "零点 缩放"，之后每行 "左 右" (或旧格式的单个数值)
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::drivers::{CalibrationResult, FeedbackMode, RecordError};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RecordedRow {
    Powers { left: f64, right: f64 },
    Level(f64),
}

impl RecordedRow {
    /// 回放用的原始指标；功率非正时得到 NaN，缩放后落在零线上
    pub fn metric(&self, mode: FeedbackMode) -> f64 {
        match *self {
            RecordedRow::Powers { left, right } => mode.compute(left, right).unwrap_or(f64::NAN),
            RecordedRow::Level(value) => value,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BlockRecord {
    pub zero_point: f64,
    pub spread_scale: f64,
    pub rows: Vec<RecordedRow>,
}

pub fn block_path(dir: &Path, subject: &str, session: u32, block: usize, extension: &str) -> PathBuf {
    dir.join(format!("{subject}.{session}.{block}.{extension}"))
}

pub fn write_block(
    path: &Path,
    calibration: &CalibrationResult,
    rows: &[RecordedRow],
) -> Result<(), RecordError> {
    if path.exists() {
        warn!("{} already exists; overwriting", path.display());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "{} {}", calibration.zero_point, calibration.spread_scale)?;
    for row in rows {
        match row {
            RecordedRow::Powers { left, right } => writeln!(w, "{left} {right}")?,
            RecordedRow::Level(value) => writeln!(w, "{value}")?,
        }
    }
    w.flush()?;
    info!("saved {} rows to {}", rows.len(), path.display());
    Ok(())
}

pub fn read_block(path: &Path) -> Result<BlockRecord, RecordError> {
    let reader = BufReader::new(File::open(path)?);
    let format_error = |line: usize, reason: String| RecordError::ReplayFormat {
        path: path.to_path_buf(),
        line,
        reason,
    };
    let mut header = None;
    let mut rows = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        let numbers = line
            .split_whitespace()
            .map(|token| token.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| format_error(line_no, err.to_string()))?;
        if header.is_none() {
            match numbers.as_slice() {
                [zero, scale] => header = Some((*zero, *scale)),
                _ => return Err(format_error(line_no, "header must be `zero scale`".into())),
            }
            continue;
        }
        rows.push(match numbers.as_slice() {
            [left, right] => RecordedRow::Powers {
                left: *left,
                right: *right,
            },
            [value] => RecordedRow::Level(*value),
            other => return Err(format_error(line_no, format!("expected 1 or 2 values, found {}", other.len()))),
        });
    }
    let (zero_point, spread_scale) = header.ok_or_else(|| format_error(0, "empty file".into()))?;
    Ok(BlockRecord {
        zero_point,
        spread_scale,
        rows,
    })
}

/// A recorded session from another subject, identified by its file stem.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReplaySource {
    pub subject: String,
    pub session: u32,
}

/// Recorded asymmetry sessions that reached block `min_blocks`.
pub fn discover_replay_sources(
    dir: &Path,
    min_blocks: usize,
    exclude_subject: &str,
) -> Result<Vec<ReplaySource>, RecordError> {
    let mut blocks: BTreeMap<ReplaySource, Vec<usize>> = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".alfa") else { continue };
        // 被试名里可能有点号，从右边拆
        let mut parts = stem.rsplitn(3, '.');
        let (Some(block), Some(session), Some(subject)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let (Ok(block), Ok(session)) = (block.parse::<usize>(), session.parse::<u32>()) else {
            continue;
        };
        if subject == exclude_subject {
            continue;
        }
        blocks
            .entry(ReplaySource {
                subject: subject.to_string(),
                session,
            })
            .or_default()
            .push(block);
    }
    Ok(blocks
        .into_iter()
        .filter(|(_, found)| found.contains(&min_blocks.max(1)))
        .map(|(source, _)| source)
        .collect())
}

/// Every block of a recorded session, as raw metric series.
#[derive(Clone, Debug)]
pub struct ReplaySession {
    pub source: ReplaySource,
    pub calibration: CalibrationResult,
    pub blocks: Vec<Vec<f64>>,
}

/// Loads blocks 1, 2, ... until the first missing file. The first block's
/// header supplies the calibration used while replaying.
pub fn load_replay_session(dir: &Path, source: ReplaySource) -> Result<ReplaySession, RecordError> {
    let mut calibration = None;
    let mut blocks = Vec::new();
    for block in 1.. {
        let path = block_path(dir, &source.subject, source.session, block, "alfa");
        if !path.exists() {
            break;
        }
        let record = read_block(&path)?;
        calibration.get_or_insert(CalibrationResult::restored(record.zero_point, record.spread_scale));
        let series: Vec<f64> = record
            .rows
            .iter()
            .map(|row| row.metric(FeedbackMode::Asymmetry))
            .collect();
        info!("loaded replay block {} ({} samples)", path.display(), series.len());
        blocks.push(series);
    }
    let calibration = calibration.ok_or_else(|| RecordError::ReplayFormat {
        path: block_path(dir, &source.subject, source.session, 1, "alfa"),
        line: 0,
        reason: "no blocks recorded".into(),
    })?;
    Ok(ReplaySession {
        source,
        calibration,
        blocks,
    })
}

/// Walks one replayed block at the pace live feedback would have moved.
#[derive(Clone, Debug)]
pub struct ReplayCursor<'a> {
    values: &'a [f64],
    position: usize,
    forward: bool,
    frames_per_step: usize,
    frames_left: usize,
}

impl<'a> ReplayCursor<'a> {
    /// Live levels change roughly every fifth display frame.
    pub const FRAMES_PER_STEP: usize = 5;

    /// `block` is 1-based; sessions longer than the recording wrap around.
    pub fn new(session: &'a ReplaySession, block: usize) -> Self {
        let values = match session.blocks.len() {
            0 => &[][..],
            len => session.blocks[(block.max(1) - 1) % len].as_slice(),
        };
        Self {
            values,
            position: 0,
            forward: true,
            frames_per_step: Self::FRAMES_PER_STEP,
            frames_left: Self::FRAMES_PER_STEP,
        }
    }

    /// Value to show this frame. Bounces back at either end of the block.
    pub fn next_frame(&mut self) -> Option<f64> {
        let value = *self.values.get(self.position)?;
        self.frames_left -= 1;
        if self.frames_left == 0 {
            self.frames_left = self.frames_per_step;
            let last = self.values.len() - 1;
            if self.position == last {
                self.forward = false;
            } else if self.position == 0 {
                self.forward = true;
            }
            if self.forward {
                self.position = (self.position + 1).min(last);
            } else {
                self.position = self.position.saturating_sub(1);
            }
        }
        Some(value)
    }
}
