// src/types.rs
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::drivers::{BarGeometry, FeedbackMode};

// 实验条件 (每个被试按分组字符串逐次分配)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Asymmetry,  // A: 真反馈，最大化右-左差值
    Relaxation, // R: 真反馈，最大化左右之和
    Replay,     // F: 假反馈，回放其他被试的记录
}

impl Condition {
    pub fn from_code(code: char) -> Option<Self> {
        match code.to_ascii_uppercase() {
            'A' => Some(Condition::Asymmetry),
            'R' => Some(Condition::Relaxation),
            'F' => Some(Condition::Replay),
            _ => None,
        }
    }

    pub fn code(self) -> char {
        match self {
            Condition::Asymmetry => 'A',
            Condition::Relaxation => 'R',
            Condition::Replay => 'F',
        }
    }

    /// 回放的记录都是不对称性条件录下的
    pub fn metric_mode(self) -> FeedbackMode {
        match self {
            Condition::Asymmetry | Condition::Replay => FeedbackMode::Asymmetry,
            Condition::Relaxation => FeedbackMode::Relaxation,
        }
    }

    /// 放松条件单独存放，永远不会被回放
    pub fn record_extension(self) -> &'static str {
        match self {
            Condition::Asymmetry | Condition::Replay => "alfa",
            Condition::Relaxation => "relaks",
        }
    }
}

// 操作员按键
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorCommand {
    Continue,     // 结束等待 / 跳过当前阶段
    RestartBlock, // 丢弃当前块并重做
    Quit,
}

// 触发码 (发给 EEG 记录设备)
pub mod trigger {
    pub const CALIBRATION_START: u8 = 1;
    pub const BLOCK_START: u8 = 2;
    pub const REST: u8 = 3;
    pub const LEVEL_UPDATE: u8 = 4;
    pub const RESTING_EYES_OPEN: u8 = 5;
    pub const RESTING_EYES_CLOSED: u8 = 6;
    pub const RESTING_END: u8 = 7;
    pub const CALIBRATION_EYES_CLOSED: u8 = 8;
    pub const CALIBRATION_END: u8 = 9;
}

/// Fire-and-forget marker output.
pub trait TriggerPort: Send {
    fn send(&mut self, code: u8);
}

/// Writes markers to the log instead of hardware.
#[derive(Debug, Default)]
pub struct LogTriggerPort {
    pub sent: Vec<u8>,
}
impl TriggerPort for LogTriggerPort {
    fn send(&mut self, code: u8) {
        if code == trigger::LEVEL_UPDATE {
            debug!("trigger {code}");
        } else {
            info!("trigger {code}");
        }
        self.sent.push(code);
    }
}

/// Render boundary: receives the bar and operator-facing text.
pub trait FeedbackDisplay: Send {
    fn show_message(&mut self, text: &str);
    fn show_bar(&mut self, bar: BarGeometry, level: f64);
    fn hide_bar(&mut self);
}

/// Headless display that only logs.
#[derive(Debug, Default)]
pub struct LogDisplay {
    pub frames: usize,
}
impl FeedbackDisplay for LogDisplay {
    fn show_message(&mut self, text: &str) {
        info!("[display] {text}");
    }
    fn show_bar(&mut self, bar: BarGeometry, level: f64) {
        self.frames += 1;
        debug!(
            "[display] level {level:+.3} bar centre {:+.3} half-length {:.3}",
            bar.center, bar.length
        );
    }
    fn hide_bar(&mut self) {
        debug!("[display] bar hidden");
    }
}

/// Current feedback level: one writer, any number of readers.
#[derive(Debug)]
pub struct LevelCell(AtomicU64);

impl LevelCell {
    pub fn new(level: f64) -> Self {
        Self(AtomicU64::new(level.to_bits()))
    }
    pub fn store(&self, level: f64) {
        self.0.store(level.to_bits(), Ordering::Release);
    }
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }
}
