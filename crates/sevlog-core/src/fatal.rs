//! Fatal-path state machine.
//!
//! ```text
//! Normal ──enter()──▶ FatalInProgress ──finish()──▶ Terminated
//! ```
//!
//! Exactly one caller wins [`FatalHandler::enter`] and runs the fatal sequence;
//! every other fatal caller parks in [`FatalHandler::wait`] until the winner
//! has terminated. In production the process is gone before they wake up;
//! with a test exit hook they return once the sequence is complete.

use std::{
    fmt::Write as _,
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicU8, Ordering},
    },
};

use crate::{
    dispatch::{Meta, Stack},
    platform,
};

/// Called with the exit code at the end of the fatal sequence.
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// The default hook: terminate the process.
pub fn process_exit() -> ExitHook {
    Arc::new(exit_process)
}

fn exit_process(code: i32) {
    std::process::exit(code)
}

/// Which fatal sequence to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// Full sequence with a stack dump; exit code 255.
    Fatal,
    /// Graceful exit through the fatal path, no stacks; exit code 1.
    Exit,
}

impl FatalKind {
    pub const fn exit_code(self) -> i32 {
        match self {
            FatalKind::Fatal => 255,
            FatalKind::Exit => 1,
        }
    }

    pub const fn dumps_stacks(self) -> bool {
        matches!(self, FatalKind::Fatal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FatalState {
    Normal = 0,
    FatalInProgress = 1,
    Terminated = 2,
}

impl FatalState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FatalState::Normal,
            1 => FatalState::FatalInProgress,
            _ => FatalState::Terminated,
        }
    }
}

/// The first fatal record, as written.
#[derive(Debug, Clone)]
pub struct FatalMessage {
    pub meta: Meta,
    pub line: String,
}

pub struct FatalHandler {
    state: AtomicU8,
    lock: Mutex<()>,
    terminated: Condvar,
    message: Mutex<Option<FatalMessage>>,
    exit_hook: Mutex<ExitHook>,
}

impl Default for FatalHandler {
    fn default() -> Self {
        Self::new(process_exit())
    }
}

impl FatalHandler {
    pub fn new(exit_hook: ExitHook) -> Self {
        Self {
            state: AtomicU8::new(FatalState::Normal as u8),
            lock: Mutex::new(()),
            terminated: Condvar::new(),
            message: Mutex::new(None),
            exit_hook: Mutex::new(exit_hook),
        }
    }

    pub fn state(&self) -> FatalState {
        FatalState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Claim the fatal sequence. Returns `true` for exactly one caller.
    pub fn enter(&self) -> bool {
        self.state
            .compare_exchange(
                FatalState::Normal as u8,
                FatalState::FatalInProgress as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until the winning caller has finished.
    pub fn wait(&self) {
        let mut guard = self.guard();
        while self.state() != FatalState::Terminated {
            guard = self.terminated.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Mark the sequence complete, wake the waiters, run the exit hook.
    pub fn finish(&self, kind: FatalKind) {
        {
            let _guard = self.guard();
            self.state.store(FatalState::Terminated as u8, Ordering::Release);
            self.terminated.notify_all();
        }
        let hook = Arc::clone(&*self.exit_hook.lock().unwrap_or_else(|e| e.into_inner()));
        hook(kind.exit_code());
    }

    pub fn set_exit_hook(&self, hook: ExitHook) {
        *self.exit_hook.lock().unwrap_or_else(|e| e.into_inner()) = hook;
    }

    /// Keep the first fatal record only.
    pub fn save_message(&self, meta: &Meta, line: &[u8]) {
        let mut slot = self.message.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(FatalMessage { meta: meta.clone(), line: String::from_utf8_lossy(line).into_owned() });
        }
    }

    pub fn message(&self) -> Option<FatalMessage> {
        self.message.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Stack of the calling thread followed by every other live thread.
///
/// Only the calling thread can be unwound; the others are listed by id and
/// name where the OS exposes them.
pub fn thread_dump() -> String {
    let mut dump = Stack::capture().as_str().to_string();
    let me = platform::thread_id();
    for (tid, name) in platform::live_threads() {
        if tid != me {
            let _ = writeln!(dump, "thread '{name}' ({tid}) [stack not available]\n");
        }
    }
    dump
}
