// src/drivers/mod.rs
// 信号处理链：采集源 -> 滑动窗口 -> 频谱功率 -> 指标 -> 标定/缩放
pub mod buffer;
pub mod calibration;
pub mod error;
pub mod metric;
pub mod pipeline;
pub mod scaler;
pub mod source;
pub mod spectral;
// 公开导出常用类型，方便外部调用
pub use buffer::{SlidingWindow, SlidingWindowBuffer};
pub use calibration::{
    CalibrationEngine, CalibrationOutcome, CalibrationRatio, CalibrationResult,
    DEFAULT_SPREAD_SCALE,
};
pub use error::{PipelineError, RecordError};
pub use metric::FeedbackMode;
pub use pipeline::{AnalysisPass, HemisphereMontage, HemispherePowers, SignalPipeline};
pub use scaler::{BarGeometry, LevelScaler};
#[cfg(test)]
pub use source::ManualSource;
pub use source::{ChannelSample, SampleSource, SamplePacer, SyntheticSource, Tone};
pub use spectral::{FrequencyBand, SpectralPowerEstimator};
