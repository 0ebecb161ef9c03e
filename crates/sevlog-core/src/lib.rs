//! sevlog-core: leveled logging engine.
//!
//! Severity-tiered output (INFO, WARNING, ERROR, FATAL) cascading into every
//! less severe file, runtime-adjustable verbosity with per-file pattern
//! overrides, size and date based file rotation, structured sinks with
//! on-demand stack capture, and a fatal path that dumps stacks, syncs, and
//! exits.
//!
//! # Lifecycle
//!
//! Programs call [`init`] once at startup with their [`LogConfig`]; it builds
//! the process-wide [`Logger`] and starts its flush daemon. Code that logs
//! before (or without) `init` gets a logger configured from the `SEVLOG_*`
//! environment variables through [`global`]. [`shutdown`] stops the daemon
//! and syncs the files. Libraries and tests that want no global state build
//! their own [`Logger`].
//!
//! # Example
//!
//! ```no_run
//! use sevlog_core::{LogConfig, Severity, log, vlog};
//!
//! sevlog_core::init(LogConfig { v: Some(1), ..Default::default() })?;
//! log!(Severity::Info, "listening on {}", 8080)?;
//! vlog!(2, "per-request detail")?;
//! sevlog_core::shutdown()?;
//! # Ok::<(), sevlog_core::LogError>(())
//! ```

pub mod bridge;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fatal;
pub mod file_sink;
pub mod flush;
pub mod header;
pub mod level;
pub mod logger;
pub mod platform;
pub mod severity;
pub mod stats;

use std::sync::OnceLock;

pub use bridge::SevlogLayer;
pub use config::{LogConfig, load_config};
pub use dispatch::{Meta, Sink, Stack, TextSink};
pub use error::{LogError, Result};
pub use level::{Level, PatternRule};
pub use logger::{Logger, LoggerBuilder};
pub use severity::Severity;

static GLOBAL: OnceLock<Logger> = OnceLock::new();

/// Build the process-wide logger from `config` and start its flush daemon.
///
/// Fails with [`LogError::AlreadyInitialized`] if the global logger exists,
/// including one created lazily by [`global`].
pub fn init(config: LogConfig) -> Result<&'static Logger> {
    if GLOBAL.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }
    GLOBAL.set(Logger::new(config)?).map_err(|_| LogError::AlreadyInitialized)?;
    let logger = global();
    logger.start_flush_daemon()?;
    Ok(logger)
}

/// The process-wide logger, created from the environment on first use.
pub fn global() -> &'static Logger {
    GLOBAL.get_or_init(|| {
        let config = LogConfig::from_env().unwrap_or_else(|e| {
            eprintln!("sevlog: ignoring environment: {e}");
            LogConfig::default()
        });
        let logger = Logger::new(config).unwrap_or_else(|e| {
            eprintln!("sevlog: using defaults: {e}");
            Logger::default()
        });
        if let Err(e) = logger.start_flush_daemon() {
            eprintln!("sevlog: no flush daemon: {e}");
        }
        logger
    })
}

/// Stop the global flush daemon and sync all files. A no-op if the global
/// logger was never used.
pub fn shutdown() -> Result<()> {
    GLOBAL.get().map_or(Ok(()), Logger::shutdown)
}

/// Log a formatted record at a severity.
///
/// ```ignore
/// log!(Severity::Warning, "slow request: {} ms", ms);
/// log!(logger: &my_logger, Severity::Error, "failed: {err}");
/// ```
#[macro_export]
macro_rules! log {
    (logger: $logger:expr, $sev:expr, $($arg:tt)+) => {{
        let logger: &$crate::Logger = &$logger;
        logger.log($sev, format_args!($($arg)+))
    }};
    ($sev:expr, $($arg:tt)+) => {
        $crate::global().log($sev, format_args!($($arg)+))
    };
}

/// Log at INFO if verbosity `level` is enabled at this call site.
///
/// Evaluates to `Ok(0)` when the record is suppressed.
#[macro_export]
macro_rules! vlog {
    (logger: $logger:expr, $level:expr, $($arg:tt)+) => {{
        let logger: &$crate::Logger = &$logger;
        if logger.v($level) {
            logger.log($crate::Severity::Info, format_args!($($arg)+))
        } else {
            $crate::Result::Ok(0)
        }
    }};
    ($level:expr, $($arg:tt)+) => {{
        let logger = $crate::global();
        if logger.v($level) {
            logger.log($crate::Severity::Info, format_args!($($arg)+))
        } else {
            $crate::Result::Ok(0)
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::tests::harness;

    #[test]
    fn macros_use_the_given_logger() {
        let h = harness();
        log!(logger: h.logger, Severity::Warning, "answer {}", 42).unwrap();
        log!(logger: &h.logger, Severity::Info, "plain").unwrap();
        assert_eq!(vlog!(logger: h.logger, 1, "hidden").unwrap(), 0);
        h.logger.set_level(1);
        assert!(vlog!(logger: h.logger, 1, "shown").unwrap() > 0);

        let info = h.file(Severity::Info);
        assert!(info.contains("lib.rs:"));
        assert!(info.contains("] answer 42\n"));
        assert!(info.contains("] plain\n"));
        assert!(!info.contains("hidden"));
        assert!(info.contains("] shown\n"));
        assert!(h.file(Severity::Warning).contains("answer 42"));
    }

    #[test]
    fn vlog_patterns_apply_per_file() {
        let h = harness();
        h.logger.set_vmodule("lib=3").unwrap();
        assert!(vlog!(logger: h.logger, 3, "from lib").unwrap() > 0);
        h.logger.set_vmodule("elsewhere=3").unwrap();
        assert_eq!(vlog!(logger: h.logger, 3, "suppressed").unwrap(), 0);
    }
}
