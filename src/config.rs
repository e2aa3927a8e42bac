// src/config.rs
// TOML 配置：所有段落都有默认值，未知字段直接报错
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::activetwo::{ActiveTwoConfig, ActiveTwoSource};
use crate::drivers::{
    CalibrationRatio, FeedbackMode, FrequencyBand, HemisphereMontage, PipelineError, SampleSource,
    SyntheticSource, Tone,
};
use crate::engine::{AcquisitionSettings, PublishPayload};
use crate::stream::DEFAULT_STREAM_NAME;

pub const DEFAULT_CONFIG_FILE: &str = "alpha-feedback.toml";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AppConfig {
    pub acquisition: AcquisitionConfig,
    pub analysis: AnalysisConfig,
    pub stream: StreamConfig,
    pub study: StudyConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[serde(rename = "activetwo")]
    #[value(name = "activetwo")]
    ActiveTwo,
    Synthetic,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AcquisitionConfig {
    pub source: SourceKind,
    pub activetwo: ActiveTwoConfig,
    pub synthetic: SyntheticConfig,
}
impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::ActiveTwo,
            activetwo: ActiveTwoConfig::default(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl AcquisitionConfig {
    /// Opens the configured source. Synthetic sources run in real time.
    pub fn open_source(&self) -> Result<Box<dyn SampleSource>, PipelineError> {
        match self.source {
            SourceKind::ActiveTwo => Ok(Box::new(ActiveTwoSource::connect(self.activetwo.clone())?)),
            SourceKind::Synthetic => {
                let synthetic = &self.synthetic;
                let source = SyntheticSource::new(
                    synthetic.channels.clone(),
                    synthetic.sample_rate_hz,
                    synthetic.tones(),
                )?
                .with_noise(synthetic.noise_amplitude, synthetic.seed)
                .paced(true);
                Ok(Box::new(source))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToneConfig {
    pub channel: String,
    pub frequency_hz: f32,
    pub amplitude: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyntheticConfig {
    pub sample_rate_hz: f32,
    pub channels: Vec<String>,
    pub tones: Vec<ToneConfig>,
    pub noise_amplitude: f32,
    pub seed: u64,
}
impl Default for SyntheticConfig {
    fn default() -> Self {
        let tone = |channel: &str, amplitude| ToneConfig {
            channel: channel.into(),
            frequency_hz: 10.0,
            amplitude,
        };
        Self {
            sample_rate_hz: 256.0,
            channels: vec!["F3".into(), "F4".into(), "Cz".into()],
            tones: vec![tone("F3", 5.0), tone("F4", 10.0)],
            noise_amplitude: 2.0,
            seed: 7,
        }
    }
}
impl SyntheticConfig {
    pub fn tones(&self) -> Vec<Tone> {
        self.tones
            .iter()
            .map(|t| Tone {
                channel: t.channel.clone(),
                frequency_hz: t.frequency_hz,
                amplitude: t.amplitude,
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AnalysisConfig {
    pub window_seconds: f32,
    pub analysis_rate_hz: f32,
    pub montage: HemisphereMontage,
    pub band_low_hz: f32,
    pub band_high_hz: f32,
    pub mode: FeedbackMode,
    pub payload: PublishPayload,
    pub workers: usize,
    pub wait_for_full_window: bool,
    pub source_retry_ms: u64,
    pub stats_interval_secs: u64,
}
impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            window_seconds: 1.0,
            analysis_rate_hz: 10.0,
            montage: HemisphereMontage::default(),
            band_low_hz: FrequencyBand::ALPHA.low_hz,
            band_high_hz: FrequencyBand::ALPHA.high_hz,
            mode: FeedbackMode::Asymmetry,
            payload: PublishPayload::Powers,
            workers: 2,
            wait_for_full_window: true,
            source_retry_ms: 1000,
            stats_interval_secs: 10,
        }
    }
}
impl AnalysisConfig {
    pub fn acquisition_settings(&self) -> AcquisitionSettings {
        AcquisitionSettings {
            window_seconds: self.window_seconds,
            analysis_rate_hz: self.analysis_rate_hz,
            montage: self.montage.clone(),
            band: FrequencyBand {
                low_hz: self.band_low_hz,
                high_hz: self.band_high_hz,
            },
            mode: self.mode,
            payload: self.payload,
            workers: self.workers,
            wait_for_full_window: self.wait_for_full_window,
            source_retry: Duration::from_millis(self.source_retry_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StreamConfig {
    /// LSL stream name, resolved by `session`.
    pub name: String,
    /// Per-attempt resolve timeout; also how long the level stream may stay silent.
    pub discovery_timeout_ms: u64,
}
impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_STREAM_NAME.into(),
            discovery_timeout_ms: 3000,
        }
    }
}
impl StreamConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StudyConfig {
    pub subjects_dir: PathBuf,
    pub records_dir: PathBuf,
    pub calibration_minutes: f64,
    pub block_minutes: f64,
    pub block_count: usize,
    pub rest_seconds: f64,
    pub resting_alpha_minutes: f64,
    pub countdown_seconds: u64,
    pub groups: Vec<String>,
    pub zero_screen_pos: f64,
    pub bar_min_length: f64,
    pub sd_span: f64,
    pub display_units: f64,
    pub threshold: f64,
    pub replay_min_blocks: usize,
    pub frame_ms: u64,
}
impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            subjects_dir: PathBuf::from("study/subjects"),
            records_dir: PathBuf::from("study/records"),
            calibration_minutes: 1.0,
            block_minutes: 6.0,
            block_count: 5,
            rest_seconds: 30.0,
            resting_alpha_minutes: 2.0,
            countdown_seconds: 5,
            // 每组 18 次会话
            groups: [
                "AAAAAAAAAFFFRRRRRR",
                "AAAAAAAAARRRRRRFFF",
                "FFFAAAAAAAAARRRRRR",
                "FFFRRRRRRAAAAAAAAA",
                "RRRRRRAAAAAAAAAFFF",
                "RRRRRRFFFAAAAAAAAA",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            zero_screen_pos: -0.6,
            bar_min_length: 0.17,
            sd_span: 3.0,
            display_units: 8.0,
            threshold: 0.0,
            replay_min_blocks: 5,
            frame_ms: 20,
        }
    }
}
impl StudyConfig {
    pub fn calibration_ratio(&self) -> CalibrationRatio {
        CalibrationRatio {
            sd_span: self.sd_span,
            display_units: self.display_units,
        }
    }
}

fn minutes(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0) * 60.0)
}
impl StudyConfig {
    pub fn calibration(&self) -> Duration {
        minutes(self.calibration_minutes)
    }
    pub fn block(&self) -> Duration {
        minutes(self.block_minutes)
    }
    pub fn resting_alpha(&self) -> Duration {
        minutes(self.resting_alpha_minutes)
    }
    pub fn rest(&self) -> Duration {
        Duration::from_secs_f64(self.rest_seconds.max(0.0))
    }
}

impl AppConfig {
    /// Reads `path`; a missing file at the default location yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        if !explicit && !path.exists() {
            log::info!("no {} found; using built-in defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_toml(&text)
            .with_context(|| format!("invalid config {}", path.display()))?;
        log::info!("loaded config {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Copy that acquires from `source`, checked again since the rate changes.
    pub fn with_source(&self, source: SourceKind) -> Result<Self> {
        let mut config = self.clone();
        config.acquisition.source = source;
        config
            .validate()
            .with_context(|| format!("configuration does not suit the {source:?} source"))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let a = &self.analysis;
        ensure!(a.window_seconds > 0.0, "analysis.window_seconds must be positive");
        ensure!(a.analysis_rate_hz > 0.0, "analysis.analysis_rate_hz must be positive");
        ensure!(
            a.band_low_hz > 0.0 && a.band_low_hz < a.band_high_hz,
            "analysis band {}-{} Hz is empty or inverted",
            a.band_low_hz,
            a.band_high_hz
        );
        ensure!(a.workers > 0, "analysis.workers must be at least 1");
        ensure!(self.stream.discovery_timeout_ms > 0, "stream.discovery_timeout_ms must be positive");
        let rate = match self.acquisition.source {
            SourceKind::ActiveTwo => self.acquisition.activetwo.sample_rate_hz,
            SourceKind::Synthetic => self.acquisition.synthetic.sample_rate_hz,
        };
        ensure!(rate > 0.0, "acquisition sample rate must be positive");
        if a.band_high_hz > rate / 2.0 {
            bail!("analysis band reaches {} Hz, above Nyquist ({} Hz)", a.band_high_hz, rate / 2.0);
        }
        let s = &self.study;
        ensure!(s.calibration_minutes >= 0.0, "study.calibration_minutes must not be negative");
        ensure!(s.block_minutes > 0.0, "study.block_minutes must be positive");
        ensure!(s.block_count > 0, "study.block_count must be at least 1");
        ensure!(s.sd_span > 0.0 && s.display_units > 0.0, "study calibration ratio must be positive");
        ensure!(s.frame_ms > 0, "study.frame_ms must be positive");
        ensure!(!s.groups.is_empty(), "study.groups must not be empty");
        for group in &s.groups {
            ensure!(
                group.chars().all(|c| crate::types::Condition::from_code(c).is_some()),
                "group '{group}' may only contain A, R and F"
            );
        }
        Ok(())
    }
}
