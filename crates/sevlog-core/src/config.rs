//! Logger configuration.
//!
//! Settings come from a JSON file ([`load_config`]), from `SEVLOG_*`
//! environment variables ([`LogConfig::from_env`]), or are filled in by the
//! embedding program. Every field is optional; the `effective_*` accessors
//! supply the defaults.
//!
//! # Example config
//!
//! ```json
//! {
//!   "v": 1,
//!   "vmodule": "server=2,net/*=3",
//!   "alsologtostderr": true,
//!   "stderrthreshold": "WARNING",
//!   "log_dir": "/var/log/myapp",
//!   "max_size": 104857600,
//!   "flush_interval_secs": 5
//! }
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    error::{LogError, Result},
    file_sink::DEFAULT_MAX_SIZE,
    flush::DEFAULT_FLUSH_INTERVAL,
    level::{Level, PatternRule, TraceLocation, parse_vmodule},
    severity::Severity,
};

/// Prefix of every environment variable read by [`LogConfig::from_env`].
pub const ENV_PREFIX: &str = "SEVLOG_";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Global verbosity threshold.
    pub v: Option<Level>,

    /// Comma-separated `pattern=N` overrides.
    pub vmodule: Option<String>,

    /// Log to stderr only, never to files.
    pub logtostderr: bool,

    /// Log to stderr in addition to files.
    pub alsologtostderr: bool,

    /// Records at or above this severity also go to stderr (default: ERROR).
    pub stderrthreshold: Option<String>,

    /// Preferred log directory; the system temp dir is the fallback.
    pub log_dir: Option<PathBuf>,

    /// `file.rs:N` location that forces a stack trace.
    pub log_backtrace_at: Option<String>,

    /// Rotate a file once it would grow beyond this many bytes.
    pub max_size: Option<u64>,

    pub flush_interval_secs: Option<u64>,
}

impl LogConfig {
    /// Read `SEVLOG_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Build a config from an arbitrary variable source (key without prefix).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Ok(Self {
            v: get("V").map(|v| parse_num("V", &v)).transpose()?,
            vmodule: get("VMODULE"),
            logtostderr: get("LOGTOSTDERR").map(|v| parse_bool("LOGTOSTDERR", &v)).transpose()?.unwrap_or(false),
            alsologtostderr: get("ALSOLOGTOSTDERR")
                .map(|v| parse_bool("ALSOLOGTOSTDERR", &v))
                .transpose()?
                .unwrap_or(false),
            stderrthreshold: get("STDERRTHRESHOLD"),
            log_dir: get("LOG_DIR").map(PathBuf::from),
            log_backtrace_at: get("LOG_BACKTRACE_AT"),
            max_size: get("MAX_SIZE").map(|v| parse_num("MAX_SIZE", &v)).transpose()?,
            flush_interval_secs: get("FLUSH_INTERVAL_SECS").map(|v| parse_num("FLUSH_INTERVAL_SECS", &v)).transpose()?,
        })
    }

    /// Fields set in `other` replace the ones in `self`.
    pub fn merge(mut self, other: LogConfig) -> Self {
        self.v = other.v.or(self.v);
        self.vmodule = other.vmodule.or(self.vmodule);
        self.logtostderr |= other.logtostderr;
        self.alsologtostderr |= other.alsologtostderr;
        self.stderrthreshold = other.stderrthreshold.or(self.stderrthreshold);
        self.log_dir = other.log_dir.or(self.log_dir);
        self.log_backtrace_at = other.log_backtrace_at.or(self.log_backtrace_at);
        self.max_size = other.max_size.or(self.max_size);
        self.flush_interval_secs = other.flush_interval_secs.or(self.flush_interval_secs);
        self
    }

    pub fn effective_v(&self) -> Level {
        self.v.unwrap_or(0)
    }

    pub fn effective_vmodule(&self) -> Result<Vec<PatternRule>> {
        self.vmodule.as_deref().map_or_else(|| Ok(Vec::new()), parse_vmodule)
    }

    pub fn effective_stderr_threshold(&self) -> Result<Severity> {
        self.stderrthreshold.as_deref().map_or(Ok(Severity::Error), str::parse)
    }

    /// Candidate directories, in order of preference.
    pub fn effective_log_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.log_dir.iter().cloned().collect();
        dirs.push(std::env::temp_dir());
        dirs
    }

    pub fn effective_backtrace_at(&self) -> Result<Option<TraceLocation>> {
        self.log_backtrace_at.as_deref().map(str::parse).transpose()
    }

    pub fn effective_max_size(&self) -> u64 {
        self.max_size.unwrap_or(DEFAULT_MAX_SIZE)
    }

    pub fn effective_flush_interval(&self) -> Duration {
        self.flush_interval_secs.map_or(DEFAULT_FLUSH_INTERVAL, Duration::from_secs)
    }

    /// Check every field without applying anything.
    pub fn validate(&self) -> Result<()> {
        if self.v.is_some_and(|v| v < 0) {
            return Err(LogError::Config(format!("v: level must be non-negative, got {}", self.effective_v())));
        }
        self.effective_vmodule()?;
        self.effective_stderr_threshold()?;
        self.effective_backtrace_at()?;
        if self.max_size == Some(0) {
            return Err(LogError::Config("max_size: must be positive".into()));
        }
        if self.flush_interval_secs == Some(0) {
            return Err(LogError::Config("flush_interval_secs: must be positive".into()));
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| LogError::Config(format!("{ENV_PREFIX}{key}: {value:?}: {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        _ => Err(LogError::Config(format!("{ENV_PREFIX}{key}: not a boolean: {value:?}"))),
    }
}

/// Load and parse a JSON config file.
pub fn load_config(path: &Path) -> Result<LogConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LogError::file(path, e))?;
    let config: LogConfig =
        serde_json::from_str(&content).map_err(|e| LogError::Config(format!("{}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}
