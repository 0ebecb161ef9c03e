//! Record metadata and the structured sink dispatcher.
//!
//! Structured sinks receive the record's [`Meta`] and the unformatted
//! `fmt::Arguments`, so they never have to re-parse a formatted line. A sink
//! may additionally declare that it wants a stack trace for a record; the
//! dispatcher then captures one stack, once, and attaches it to the meta that
//! every sink sees.
//!
//! The sink list lives behind an `ArcSwap`: dispatching never takes a lock,
//! and replacing the list (tests do this a lot) does not disturb a dispatch
//! that already loaded the previous list.

use std::{
    any::Any,
    backtrace::Backtrace,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Local};

use crate::{error::Result, header::format_record, platform, severity::Severity};

/// Opaque caller context carried alongside a record.
pub type Context = Arc<dyn Any + Send + Sync>;

// ---------------------------------------------------------------------------
// Meta / Stack
// ---------------------------------------------------------------------------

/// Immutable snapshot describing one log call.
#[derive(Debug, Clone)]
pub struct Meta {
    pub severity: Severity,
    pub time: DateTime<Local>,
    /// Source file of the call site, as produced by `file!()`.
    pub file: &'static str,
    pub line: u32,
    /// Id printed in the header. Defaults to the process id.
    pub thread: u64,
    /// Wrapper frames between the reported call site and the code that
    /// asked for the record, as given to [`Logger::log_depth`].
    ///
    /// [`Logger::log_depth`]: crate::Logger::log_depth
    pub depth: usize,
    pub stack: Option<Arc<Stack>>,
    pub context: Option<Context>,
}

impl Meta {
    pub fn new(severity: Severity, time: DateTime<Local>, file: &'static str, line: u32) -> Self {
        Self { severity, time, file, line, thread: platform::pid(), depth: 0, stack: None, context: None }
    }

    pub fn with_stack(mut self, stack: Arc<Stack>) -> Self {
        self.stack = Some(stack);
        self
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }
}

/// A captured stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    text: String,
}

impl Stack {
    /// Capture the calling thread's stack, regardless of `RUST_BACKTRACE`.
    pub fn capture() -> Self {
        let current = std::thread::current();
        let name = current.name().unwrap_or("<unnamed>");
        let trace = Backtrace::force_capture();
        Self { text: format!("thread '{name}' ({}) [running]:\n{trace}\n", platform::thread_id()) }
    }

    /// A stack obtained elsewhere (e.g. carried in from another process).
    pub fn from_text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

// ---------------------------------------------------------------------------
// Sink traits
// ---------------------------------------------------------------------------

/// A consumer of raw records.
pub trait Sink: Send + Sync {
    /// Consume one record. Returns the number of bytes the sink wrote.
    fn emit(&self, meta: &Meta, args: fmt::Arguments<'_>) -> Result<usize>;

    /// Stack query capability. Sinks that never need a stack keep the
    /// default; returning `true` guarantees `meta.stack` is set on `emit`.
    fn wants_stack(&self, _meta: &Meta) -> bool {
        false
    }
}

/// A consumer of fully formatted lines.
pub trait TextSink: Send + Sync {
    fn enabled(&self, meta: &Meta) -> bool;

    /// Consume the formatted line (header, message, trailing newline).
    fn emit(&self, meta: &Meta, line: &[u8]) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub type SinkList = Vec<Arc<dyn Sink>>;

/// Ordered, swappable list of structured sinks.
pub struct Dispatcher {
    sinks: ArcSwap<SinkList>,
    captures: AtomicU64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self { sinks: ArcSwap::from_pointee(Vec::new()), captures: AtomicU64::new(0) }
    }

    /// Append a sink; it runs after every sink registered before it.
    pub fn register(&self, sink: Arc<dyn Sink>) {
        self.sinks.rcu(|current| {
            let mut next = SinkList::clone(current);
            next.push(Arc::clone(&sink));
            next
        });
    }

    /// Replace the whole list, returning the previous one.
    pub fn replace(&self, sinks: SinkList) -> Arc<SinkList> {
        self.sinks.swap(Arc::new(sinks))
    }

    /// Remove every sink, returning the previous list.
    pub fn clear(&self) -> Arc<SinkList> {
        self.replace(Vec::new())
    }

    /// The list as seen by a dispatch starting now.
    pub fn snapshot(&self) -> Arc<SinkList> {
        self.sinks.load_full()
    }

    pub fn len(&self) -> usize {
        self.sinks.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stacks captured by this dispatcher so far.
    pub fn stack_captures(&self) -> u64 {
        self.captures.load(Ordering::Relaxed)
    }

    /// Hand one record to every sink, in registration order.
    ///
    /// Attaches a stack to `meta` first if some sink wants one and none is
    /// present. Every sink runs even if an earlier one fails; the result is the
    /// largest byte count reported, or the first error.
    pub fn dispatch(&self, meta: &mut Meta, args: fmt::Arguments<'_>) -> Result<usize> {
        let sinks = self.sinks.load_full();
        if sinks.is_empty() {
            return Ok(0);
        }
        if meta.stack.is_none() && sinks.iter().any(|s| s.wants_stack(meta)) {
            self.captures.fetch_add(1, Ordering::Relaxed);
            meta.stack = Some(Arc::new(Stack::capture()));
        }
        let meta: &Meta = meta;
        fan_out(sinks.iter(), |sink| sink.emit(meta, args))
    }
}

/// Run `emit` over every item; largest count or first error.
pub(crate) fn fan_out<T>(items: impl Iterator<Item = T>, mut emit: impl FnMut(T) -> Result<usize>) -> Result<usize> {
    let mut written = 0;
    let mut first_err = None;
    for item in items {
        match emit(item) {
            Ok(n) => written = written.max(n),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }
    first_err.map_or(Ok(written), Err)
}

// ---------------------------------------------------------------------------
// TextAdapter
// ---------------------------------------------------------------------------

/// A structured sink that formats the line once and forwards it to a set of
/// text sinks.
pub struct TextAdapter {
    sinks: Vec<Arc<dyn TextSink>>,
}

impl TextAdapter {
    pub fn new(sinks: Vec<Arc<dyn TextSink>>) -> Self {
        Self { sinks }
    }
}

impl Sink for TextAdapter {
    fn emit(&self, meta: &Meta, args: fmt::Arguments<'_>) -> Result<usize> {
        let mut enabled = self.sinks.iter().filter(|s| s.enabled(meta)).peekable();
        if enabled.peek().is_none() {
            return Ok(0);
        }
        let mut line = Vec::new();
        format_record(&mut line, meta, args, None);
        fan_out(enabled, |sink| sink.emit(meta, &line))
    }
}
