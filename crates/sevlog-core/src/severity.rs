//! Record severities and their cascading order.
//!
//! A record written at severity `S` lands in the output for `S` and in the
//! output of every less severe level, never in a more severe one. The enum is
//! ordered by importance so comparisons read naturally
//! (`Severity::Error > Severity::Warning`).

use std::{fmt, str::FromStr};

use crate::error::LogError;

/// Importance tier of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Severity {
    Info = 0,
    Warning = 1,
    Error = 2,
    Fatal = 3,
}

impl Severity {
    /// Number of severities.
    pub const COUNT: usize = 4;

    /// All severities, least severe first.
    pub const ALL: [Severity; Self::COUNT] = [Severity::Info, Severity::Warning, Severity::Error, Severity::Fatal];

    /// Dense index usable for per-severity arrays.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Severity for a dense index, if in range.
    pub const fn from_index(idx: usize) -> Option<Self> {
        match idx {
            0 => Some(Severity::Info),
            1 => Some(Severity::Warning),
            2 => Some(Severity::Error),
            3 => Some(Severity::Fatal),
            _ => None,
        }
    }

    /// One-letter code that starts every formatted line.
    #[inline]
    pub const fn as_char(self) -> u8 {
        match self {
            Severity::Info => b'I',
            Severity::Warning => b'W',
            Severity::Error => b'E',
            Severity::Fatal => b'F',
        }
    }

    /// Upper-case name, as used in file names.
    pub const fn name(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }

    /// This severity followed by every less severe one, most severe first.
    pub fn cascade(self) -> impl Iterator<Item = Severity> {
        Self::ALL[..=self.index()].iter().rev().copied()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Severity {
    type Err = LogError;

    /// Accepts a case-insensitive name (`"warning"`) or a numeric index (`"1"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(idx) = s.parse::<usize>() {
            return Self::from_index(idx).ok_or_else(|| LogError::Config(format!("unknown severity index {idx}")));
        }
        Self::ALL
            .into_iter()
            .find(|sev| sev.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| LogError::Config(format!("unknown severity {s:?}")))
    }
}
