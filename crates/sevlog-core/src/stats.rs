//! Per-severity output counters.
//!
//! Counters are bumped after a record has been written successfully and are
//! read with plain atomic loads, so monitoring code never contends with the
//! write path.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::severity::Severity;

/// Lines and bytes written at one severity.
#[derive(Debug, Default)]
pub struct OutputStats {
    lines: AtomicI64,
    bytes: AtomicI64,
}

impl OutputStats {
    /// Number of lines written.
    pub fn lines(&self) -> i64 {
        self.lines.load(Ordering::Relaxed)
    }

    /// Number of bytes written.
    pub fn bytes(&self) -> i64 {
        self.bytes.load(Ordering::Relaxed)
    }

    #[inline]
    fn add(&self, bytes: usize) {
        self.lines.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as i64, Ordering::Relaxed);
    }
}

/// Counters for INFO, WARNING and ERROR. FATAL records are not counted.
#[derive(Debug, Default)]
pub struct Stats {
    pub info: OutputStats,
    pub warning: OutputStats,
    pub error: OutputStats,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter pair for `sev`, if it has one.
    pub fn get(&self, sev: Severity) -> Option<&OutputStats> {
        match sev {
            Severity::Info => Some(&self.info),
            Severity::Warning => Some(&self.warning),
            Severity::Error => Some(&self.error),
            Severity::Fatal => None,
        }
    }

    /// Record one successfully written line of `bytes` bytes at `sev`.
    #[inline]
    pub fn record(&self, sev: Severity, bytes: usize) {
        if let Some(stats) = self.get(sev) {
            stats.add(bytes);
        }
    }
}
