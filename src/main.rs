// src/main.rs
mod activetwo;
mod config;
mod drivers;
mod engine;
mod operator;
mod recorder;
mod session;
mod stats;
mod stream;
mod subject;
mod types;
mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use crate::config::{AcquisitionConfig, AppConfig, SourceKind};
use crate::drivers::{PipelineError, SampleSource};
use crate::engine::{spawn_acquisition, AcquisitionHandle};
use crate::operator::OperatorConsole;
use crate::session::{assign_group, prepare_state, Session, SessionSettings};
use crate::stream::{LocalHub, LslInlet, LslOutlet, MetricInlet, MetricOutlet};
use crate::subject::SubjectRecord;
use crate::types::{LogDisplay, LogTriggerPort, OperatorCommand};

#[derive(Parser)]
#[command(
    name = "alpha-feedback",
    version,
    about = "Real-time hemispheric alpha neurofeedback"
)]
struct Cli {
    /// Configuration file (defaults to ./alpha-feedback.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire EEG and publish the alpha metric as an LSL stream
    Analyse {
        #[arg(long, value_enum)]
        source: Option<SourceKind>,
        /// Stop after this many seconds instead of running until killed
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Run one feedback session for a subject
    Session {
        #[arg(long)]
        subject: String,
        /// Create the subject record and assign a group
        #[arg(long)]
        new: bool,
        /// Run a synthetic acquisition loop in-process instead of resolving the LSL stream
        #[arg(long)]
        embedded: bool,
    },
    /// Print a subject record or block record as JSON
    InspectRecord { file: PathBuf },
}

// 入口函数
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Analyse {
            source,
            duration_secs,
        } => analyse(&config, source, duration_secs.map(Duration::from_secs)),
        Commands::Session {
            subject,
            new,
            embedded,
        } => run_session(&config, &subject, new, embedded),
        Commands::InspectRecord { file } => inspect_record(&file),
    }
}

/// 采集源打不开时按间隔重试，直到成功
fn open_source_with_retry(acquisition: &AcquisitionConfig, retry: Duration) -> Box<dyn SampleSource> {
    loop {
        match acquisition.open_source() {
            Ok(source) => return source,
            Err(err) => {
                warn!("sample source unavailable: {err}; retrying in {retry:?}");
                thread::sleep(retry);
            }
        }
    }
}

fn start_acquisition(config: &AppConfig, outlet: Arc<dyn MetricOutlet>) -> Result<AcquisitionHandle> {
    let settings = config.analysis.acquisition_settings();
    let source = open_source_with_retry(&config.acquisition, settings.source_retry);
    let labels = source.channel_labels();
    for channel in [&settings.montage.left, &settings.montage.right, &settings.montage.reference] {
        if !labels.contains(channel) {
            bail!("montage channel '{channel}' is not delivered by the source");
        }
    }
    spawn_acquisition(source, outlet, settings).context("failed to start acquisition")
}

fn analyse(config: &AppConfig, source: Option<SourceKind>, duration: Option<Duration>) -> Result<()> {
    let config = match source {
        Some(kind) => config.with_source(kind)?,
        None => config.clone(),
    };
    let settings = config.analysis.acquisition_settings();
    let outlet = LslOutlet::open(&config.stream.name, settings.content(), f64::from(settings.analysis_rate_hz))
        .with_context(|| format!("cannot publish stream '{}'", config.stream.name))?;
    let handle = start_acquisition(&config, Arc::new(outlet))?;
    let started = Instant::now();
    let interval = Duration::from_secs(config.analysis.stats_interval_secs.max(1));
    let mut next_report = started + interval;
    loop {
        thread::sleep(Duration::from_millis(100));
        if !handle.is_running() {
            handle.stop();
            bail!("acquisition loop exited unexpectedly");
        }
        if Instant::now() >= next_report {
            let stats = handle.stats();
            info!("loop stats {}", serde_json::to_string(&stats)?);
            next_report += interval;
        }
        if duration.map_or(false, |d| started.elapsed() >= d) {
            break;
        }
    }
    handle.stop();
    Ok(())
}

fn run_session(config: &AppConfig, subject: &str, new: bool, embedded: bool) -> Result<()> {
    let study = &config.study;
    let mut rng = rand::thread_rng();
    let path = if new {
        let group = assign_group(&study.groups, &mut rng).ok_or_else(|| anyhow!("no groups configured"))?;
        let record = SubjectRecord::create(&study.subjects_dir, subject, &group)
            .with_context(|| format!("cannot create subject '{subject}'"))?;
        info!("subject '{subject}' assigned to group {group}");
        record.path().to_path_buf()
    } else {
        SubjectRecord::path_for(&study.subjects_dir, subject)
    };
    let (record, profile) =
        SubjectRecord::open(&path).with_context(|| format!("cannot load subject record {}", path.display()))?;
    let mut settings = SessionSettings::from_study(study, &profile);
    settings.stall_timeout = config.stream.discovery_timeout();
    let name = profile.subject_name.clone().unwrap_or_else(|| subject.to_string());
    let state = prepare_state(&name, &profile, &settings, &mut rng);
    info!(
        "subject {name}, session {}, condition {:?}",
        state.session_number, state.condition
    );

    let operator = OperatorConsole::stdin().context("cannot read operator commands")?;
    let mut acquisition = None;
    let inlet: Box<dyn MetricInlet> = if embedded {
        let synthetic = config.with_source(SourceKind::Synthetic)?;
        let hub = Arc::new(LocalHub::new(synthetic.analysis.acquisition_settings().content()));
        let inlet = hub.subscribe();
        acquisition = Some(start_acquisition(&synthetic, hub)?);
        Box::new(inlet)
    } else {
        let found = LslInlet::resolve_with_retry(&config.stream.name, config.stream.discovery_timeout(), || {
            operator.poll() == Some(OperatorCommand::Quit)
        })?;
        match found {
            Some(inlet) => Box::new(inlet),
            None => bail!(PipelineError::StreamUnavailable(config.stream.name.clone())),
        }
    };

    let mut session = Session::new(
        settings,
        record,
        inlet,
        LogTriggerPort::default(),
        LogDisplay::default(),
        operator,
    );
    let result = session.run(state);
    if let Some(handle) = acquisition {
        handle.stop();
    }
    let report = result.context("session failed")?;
    match &report.summary {
        Some(stats) => info!(
            "session {} done: {} blocks, mean level {:.4}, {:.1}% at or above {}",
            report.session_number,
            report.blocks_completed,
            stats.mean,
            report.threshold.above_percent(),
            report.threshold.threshold
        ),
        None => error!("session {} recorded no levels", report.session_number),
    }
    Ok(())
}

fn inspect_record(file: &Path) -> Result<()> {
    let block = matches!(
        file.extension().and_then(|e| e.to_str()),
        Some("alfa") | Some("relaks")
    );
    let json = if block {
        let record = recorder::read_block(file).with_context(|| format!("cannot read {}", file.display()))?;
        serde_json::json!({
            "zero_point": record.zero_point,
            "spread_scale": record.spread_scale,
            "rows": record.rows.len(),
        })
    } else {
        let (_, profile) =
            SubjectRecord::open(file).with_context(|| format!("cannot read {}", file.display()))?;
        serde_json::to_value(&profile)?
    };
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
