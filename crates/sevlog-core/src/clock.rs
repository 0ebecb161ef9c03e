//! Wall-clock source for record timestamps and file rotation.
//!
//! Headers, file names and the day-boundary rotation check all read local
//! calendar time. The [`Clock`] trait lets tests pin or advance time without
//! touching the system clock.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Local, TimeZone};

/// A source of local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

// ---------------------------------------------------------------------------
// SystemClock
// ---------------------------------------------------------------------------

/// The real local clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Local>) -> Self {
        Self { now: Mutex::new(start) }
    }

    /// Clock fixed at the given local date and time.
    ///
    /// Falls back to the current time if the local time does not exist
    /// (DST gap).
    pub fn at(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32, micros: u32) -> Self {
        let start = Local
            .with_ymd_and_hms(year, month, day, hour, min, sec)
            .earliest()
            .map(|t| t + Duration::microseconds(i64::from(micros)))
            .unwrap_or_else(Local::now);
        Self::new(start)
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Local>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
