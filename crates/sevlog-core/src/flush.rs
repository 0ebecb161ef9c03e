//! Periodic background flushing.
//!
//! The daemon runs on its own named thread and wakes on a `crossbeam_channel`
//! ticker. It holds only a `Weak` handle to what it flushes, so it never keeps
//! a logger alive; once the target is gone the thread exits on the next tick.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use tracing::{debug, warn};

use crate::error::{LogError, Result};

/// Interval used when none is configured.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Something the daemon can flush.
pub trait Flush: Send + Sync {
    fn flush(&self) -> Result<()>;
}

/// Handle to the flush thread. Dropping it stops the thread.
pub struct FlushDaemon {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    ticks: Arc<AtomicU64>,
    interval: Duration,
}

impl FlushDaemon {
    /// Start flushing `target` every `interval`.
    pub fn spawn<T: Flush + ?Sized + 'static>(interval: Duration, target: Weak<T>) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);
        let handle = thread::Builder::new()
            .name("sevlog-flush".into())
            .spawn(move || run(ticker, stop_rx, target, counter))
            .map_err(LogError::Io)?;
        debug!(?interval, "flush daemon started");
        Ok(Self { stop: Some(stop_tx), handle: Some(handle), ticks, interval })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Ticks handled so far, failed flushes included.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread and wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        // Disconnecting the channel wakes the select.
        drop(self.stop.take());
        let Some(handle) = self.handle.take() else {
            return;
        };
        // The last strong handle may be released on the daemon itself.
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("flush daemon panicked");
        }
        debug!("flush daemon stopped");
    }
}

impl Drop for FlushDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<T: Flush + ?Sized>(ticker: Receiver<Instant>, stop: Receiver<()>, target: Weak<T>, ticks: Arc<AtomicU64>) {
    loop {
        select! {
            recv(ticker) -> _ => {
                let Some(target) = target.upgrade() else {
                    break;
                };
                if let Err(e) = target.flush() {
                    warn!("periodic flush failed: {e}");
                }
                ticks.fetch_add(1, Ordering::Relaxed);
            }
            recv(stop) -> _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Flush for Counting {
        fn flush(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail { Err(LogError::Sink("disk on fire".into())) } else { Ok(()) }
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn flushes_periodically_until_stopped() {
        let target = Arc::new(Counting::default());
        let mut daemon = FlushDaemon::spawn(Duration::from_millis(5), Arc::downgrade(&target)).unwrap();
        assert!(wait_until(|| target.calls.load(Ordering::SeqCst) >= 3));
        daemon.stop();
        assert!(!daemon.is_running());
        let after = target.calls.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(target.calls.load(Ordering::SeqCst), after);
        daemon.stop();
    }

    #[test]
    fn errors_do_not_stop_the_daemon() {
        let target = Arc::new(Counting { fail: true, ..Default::default() });
        let daemon = FlushDaemon::spawn(Duration::from_millis(5), Arc::downgrade(&target)).unwrap();
        assert!(wait_until(|| daemon.ticks() >= 3));
        assert!(daemon.is_running());
    }

    #[test]
    fn exits_when_target_is_dropped() {
        let target = Arc::new(Counting::default());
        let daemon = FlushDaemon::spawn(Duration::from_millis(5), Arc::downgrade(&target)).unwrap();
        drop(target);
        assert!(wait_until(|| !daemon.is_running()));
    }

    #[test]
    fn stop_returns_promptly_with_long_interval() {
        let target = Arc::new(Counting::default());
        let mut daemon = FlushDaemon::spawn(DEFAULT_FLUSH_INTERVAL, Arc::downgrade(&target)).unwrap();
        let started = Instant::now();
        daemon.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(target.calls.load(Ordering::SeqCst), 0);
    }
}
