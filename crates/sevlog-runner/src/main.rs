//! # sevlog-runner
//!
//! Drives the logging engine from the command line: applies flags and an
//! optional JSON config, routes `tracing` events through the engine, writes
//! a batch of records and optionally ends on the fatal path.
//!
//! # Usage
//!
//! ```bash
//! sevlog-runner --log-dir /tmp/logs -v 2 --vmodule 'main=3' --count 100
//! sevlog-runner --logtostderr --exit-with fatal
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sevlog_core::{LogConfig, Severity, SevlogLayer, log, vlog};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Leveled logging engine runner.
#[derive(Parser)]
#[command(name = "sevlog-runner", about = "Leveled logging engine runner")]
struct Cli {
    /// Global verbosity level.
    #[arg(short = 'v', long = "v")]
    v: Option<i32>,

    /// Comma-separated pattern=N verbosity overrides.
    #[arg(long)]
    vmodule: Option<String>,

    /// Log to stderr instead of files.
    #[arg(long)]
    logtostderr: bool,

    /// Log to stderr as well as files.
    #[arg(long)]
    alsologtostderr: bool,

    /// Records at or above this severity also go to stderr.
    #[arg(long)]
    stderrthreshold: Option<String>,

    /// Directory for log files (the temp dir is the fallback).
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// file.rs:N location that emits a stack trace when it logs.
    #[arg(long)]
    log_backtrace_at: Option<String>,

    /// JSON config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of records to write.
    #[arg(long, default_value_t = 10)]
    count: u32,

    /// End on the fatal path instead of shutting down.
    #[arg(long, value_enum)]
    exit_with: Option<ExitWith>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExitWith {
    /// FATAL record, stack dump, exit code 255.
    Fatal,
    /// FATAL record, exit code 1.
    Exit,
}

impl Cli {
    fn log_config(&self) -> Result<LogConfig> {
        let base = match &self.config {
            Some(path) => sevlog_core::load_config(path).with_context(|| format!("loading {}", path.display()))?,
            None => LogConfig::default(),
        };
        let flags = LogConfig {
            v: self.v,
            vmodule: self.vmodule.clone(),
            logtostderr: self.logtostderr,
            alsologtostderr: self.alsologtostderr,
            stderrthreshold: self.stderrthreshold.clone(),
            log_dir: self.log_dir.clone(),
            log_backtrace_at: self.log_backtrace_at.clone(),
            ..Default::default()
        };
        Ok(LogConfig::from_env()?.merge(base).merge(flags))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Configure and start the engine
    let config = cli.log_config()?;
    let logger = sevlog_core::init(config).context("initializing logger")?;

    // 2. Route tracing events through it
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trace"));
    tracing_subscriber::registry().with(filter).with(SevlogLayer::new(logger.clone())).init();

    info!(count = cli.count, "sevlog-runner starting");

    // 3. Write a batch across every severity and verbosity
    const SEVERITIES: [Severity; 3] = [Severity::Info, Severity::Warning, Severity::Error];
    for i in 0..cli.count {
        let sev = SEVERITIES[i as usize % SEVERITIES.len()];
        if let Err(e) = log!(sev, "record {i} of {}", cli.count) {
            warn!("record {i} not fully written: {e}");
        }
        vlog!(1, "verbose detail for record {i}")?;
        vlog!(3, "very verbose detail for record {i}")?;
        debug!(record = i, "bridged debug event");
    }

    let stats = logger.stats();
    info!(
        info_lines = stats.info.lines(),
        warning_lines = stats.warning.lines(),
        error_lines = stats.error.lines(),
        "batch written"
    );

    // 4. Either go down the fatal path or shut down cleanly
    match cli.exit_with {
        Some(ExitWith::Fatal) => {
            log!(Severity::Fatal, "fatal requested after {} records", cli.count)?;
        }
        Some(ExitWith::Exit) => {
            logger.exit(format_args!("exit requested after {} records", cli.count))?;
        }
        None => {}
    }

    sevlog_core::shutdown()?;
    if let Ok(names) = logger.names(Severity::Info) {
        for name in names {
            println!("{}", name.display());
        }
    }
    Ok(())
}
