//! Typed error definitions for the logging core.
//!
//! Provides [`LogError`] covering the three failure families of the engine:
//! configuration errors (rejected before they are applied), file-system errors
//! from the rotating file sink, and errors returned by registered sinks. All
//! variants implement `std::error::Error` via `thiserror`, so they integrate
//! with `anyhow::Result` in binaries.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors produced by the logging core.
#[derive(Debug, Error)]
pub enum LogError {
    /// Malformed level, pattern, severity name or config value. The
    /// offending setting is never applied.
    #[error("config error: {0}")]
    Config(String),

    /// Creating, writing or rotating a log file failed.
    #[error("log file error: {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// I/O error not tied to a specific log file (stderr, flush).
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// No log file has been written yet for the requested severity.
    #[error("log: no log file has been created yet")]
    NoLog,

    /// A structured or text sink rejected a record.
    #[error("sink error: {0}")]
    Sink(String),

    /// The process-wide logger was initialized twice.
    #[error("logger already initialized")]
    AlreadyInitialized,
}

impl LogError {
    pub(crate) fn file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::File { path: path.into(), source }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LogError>;
