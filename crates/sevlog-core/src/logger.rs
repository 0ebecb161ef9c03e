//! The process-wide logging context.
//!
//! A [`Logger`] ties the pieces together: verbosity control, the per-severity
//! file group, stderr, structured and text sinks, stats, and the fatal path.
//! It is a cheap `Arc` handle; clones share all state.
//!
//! # Write path
//!
//! 1. Fatal gate: a FATAL record must win the fatal state machine, otherwise
//!    the caller waits for the winner to terminate.
//! 2. Backtrace trigger: a record from the configured `file:line` captures a
//!    stack, printed after the message and attached to the meta.
//! 3. Format header and message once into a pooled buffer.
//! 4. Text outputs: files (unless stderr-only), stderr, text sinks.
//! 5. Stats, once the line reached at least one text output.
//! 6. Structured dispatch.
//! 7. FATAL only: save the message, dump stacks, sync, exit.

use std::{
    fmt,
    io::{self, Write},
    panic::Location,
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use crate::{
    clock::{Clock, SystemClock},
    config::LogConfig,
    dispatch::{Dispatcher, Meta, Sink, SinkList, Stack, TextSink, fan_out},
    error::{LogError, Result},
    fatal::{ExitHook, FatalHandler, FatalKind, FatalMessage, FatalState, process_exit, thread_dump},
    file_sink::{FileIdentity, FileSink, FileSinkConfig, Writers},
    flush::{Flush, FlushDaemon},
    header::{BufferPool, format_record},
    level::{Level, Verbosity},
    severity::Severity,
    stats::Stats,
};

type TextSinkList = Vec<Arc<dyn TextSink>>;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`Logger`], with hooks for replacing its collaborators.
pub struct LoggerBuilder {
    config: LogConfig,
    clock: Option<Arc<dyn Clock>>,
    stderr: Option<Box<dyn Write + Send>>,
    exit_hook: Option<ExitHook>,
    file_writers: Option<Writers>,
    identity: Option<FileIdentity>,
    log_dirs: Option<Vec<PathBuf>>,
}

impl LoggerBuilder {
    fn new() -> Self {
        Self {
            config: LogConfig::default(),
            clock: None,
            stderr: None,
            exit_hook: None,
            file_writers: None,
            identity: None,
            log_dirs: None,
        }
    }

    pub fn config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the stderr stream.
    pub fn stderr(mut self, stderr: Box<dyn Write + Send>) -> Self {
        self.stderr = Some(stderr);
        self
    }

    /// Replace `std::process::exit` at the end of the fatal path.
    pub fn exit_hook(mut self, hook: ExitHook) -> Self {
        self.exit_hook = Some(hook);
        self
    }

    /// Pre-install per-severity writers instead of creating files.
    pub fn file_writers(mut self, writers: Writers) -> Self {
        self.file_writers = Some(writers);
        self
    }

    pub fn identity(mut self, identity: FileIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Use exactly these directories, without the temp-dir fallback.
    pub fn log_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.log_dirs = Some(dirs);
        self
    }

    /// Validate the config and build the logger. The flush daemon is not
    /// started; see [`Logger::start_flush_daemon`].
    pub fn build(self) -> Result<Logger> {
        self.config.validate()?;
        let config = self.config.clone();
        let logger = self.assemble();
        logger.apply(&config)?;
        Ok(logger)
    }

    fn assemble(self) -> Logger {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let file_config = FileSinkConfig {
            dirs: self.log_dirs.unwrap_or_else(|| self.config.effective_log_dirs()),
            max_size: self.config.effective_max_size(),
            identity: self.identity.unwrap_or_else(FileIdentity::detect),
            symlinks: true,
        };
        let files = FileSink::new(file_config, Arc::clone(&clock));
        if let Some(writers) = self.file_writers {
            drop(files.swap(writers));
        }
        let inner = Inner {
            verbosity: Verbosity::new(),
            files,
            stderr: Mutex::new(self.stderr.unwrap_or_else(|| Box::new(io::stderr()))),
            dispatcher: Dispatcher::new(),
            text_sinks: ArcSwap::from_pointee(Vec::new()),
            stats: Stats::new(),
            fatal: FatalHandler::new(self.exit_hook.unwrap_or_else(process_exit)),
            pool: BufferPool::new(),
            clock,
            to_stderr: AtomicBool::new(false),
            also_to_stderr: AtomicBool::new(false),
            stderr_threshold: AtomicU8::new(Severity::Error as u8),
            flush_interval: self.config.effective_flush_interval(),
            daemon: Mutex::new(None),
        };
        Logger { inner: Arc::new(inner) }
    }
}

// ---------------------------------------------------------------------------
// Inner state
// ---------------------------------------------------------------------------

struct Inner {
    verbosity: Verbosity,
    files: FileSink,
    stderr: Mutex<Box<dyn Write + Send>>,
    dispatcher: Dispatcher,
    text_sinks: ArcSwap<TextSinkList>,
    stats: Stats,
    fatal: FatalHandler,
    pool: BufferPool,
    clock: Arc<dyn Clock>,
    to_stderr: AtomicBool,
    also_to_stderr: AtomicBool,
    stderr_threshold: AtomicU8,
    flush_interval: Duration,
    daemon: Mutex<Option<FlushDaemon>>,
}

impl Inner {
    fn to_stderr(&self) -> bool {
        self.to_stderr.load(Ordering::Relaxed)
    }

    fn stderr_threshold(&self) -> Severity {
        Severity::from_index(usize::from(self.stderr_threshold.load(Ordering::Relaxed))).unwrap_or(Severity::Error)
    }

    fn stderr_enabled(&self, sev: Severity) -> bool {
        self.to_stderr()
            || self.also_to_stderr.load(Ordering::Relaxed)
            || sev >= self.stderr_threshold()
            || sev == Severity::Fatal
    }

    fn stderr(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.stderr.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_stderr(&self, data: &[u8]) -> Result<usize> {
        self.stderr().write_all(data)?;
        Ok(data.len())
    }

    /// Files, stderr and text sinks. Every output is attempted. Returns the
    /// largest byte count any output took, and the first error.
    fn write_text(&self, meta: &Meta, line: &[u8]) -> (usize, Option<LogError>) {
        let sev = meta.severity;
        let mut written = 0;
        let mut first_err = None;
        if !self.to_stderr() {
            let files = self.files.write(sev, line);
            if files.landed() {
                written = line.len();
            }
            for e in files.errors {
                let _ = writeln!(self.stderr(), "sevlog: {e}");
                first_err.get_or_insert(e);
            }
        }
        if self.stderr_enabled(sev) {
            match self.write_stderr(line) {
                Ok(n) => written = written.max(n),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        let sinks = self.text_sinks.load();
        match fan_out(sinks.iter().filter(|s| s.enabled(meta)), |s| s.emit(meta, line)) {
            Ok(n) => written = written.max(n),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
        (written, first_err)
    }

    /// Everything after the fatal record itself has been written.
    fn finish_fatal(&self, meta: &Meta, line: &[u8], kind: FatalKind) {
        self.fatal.save_message(meta, line);
        if kind.dumps_stacks() {
            let dump = thread_dump();
            let _ = self.write_stderr(dump.as_bytes());
            if !self.to_stderr() {
                drop(self.files.write(Severity::Fatal, dump.as_bytes()));
            }
        }
        // Errors are irrelevant now; the process is going away.
        let _ = self.files.sync();
        let _ = self.stderr().flush();
        self.fatal.finish(kind);
    }
}

impl Flush for Inner {
    fn flush(&self) -> Result<()> {
        let files = self.files.flush();
        let stderr = self.stderr().flush().map_err(LogError::Io);
        files.and(stderr)
    }
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// Handle to a logging context.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Inner>,
}

impl Default for Logger {
    /// Default settings, files in the temp dir, no flush daemon.
    fn default() -> Self {
        LoggerBuilder::new().assemble()
    }
}

impl Logger {
    pub fn new(config: LogConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> LoggerBuilder {
        LoggerBuilder::new()
    }

    /// Apply the runtime-adjustable parts of `config`. Nothing is applied if
    /// any field is invalid. Directories and the flush interval are fixed at
    /// build time.
    pub fn apply(&self, config: &LogConfig) -> Result<()> {
        if let Err(e) = config.validate() {
            warn!("rejected log config: {e}");
            return Err(e);
        }
        let rules = config.effective_vmodule()?;
        let threshold = config.effective_stderr_threshold()?;
        let inner = &self.inner;
        inner.verbosity.configure(config.effective_v(), rules);
        inner.verbosity.set_backtrace_at(config.log_backtrace_at.as_deref().unwrap_or(""))?;
        inner.to_stderr.store(config.logtostderr, Ordering::Relaxed);
        inner.also_to_stderr.store(config.alsologtostderr, Ordering::Relaxed);
        self.set_stderr_threshold(threshold);
        inner.files.set_max_size(config.effective_max_size());
        debug!(v = config.effective_v(), vmodule = ?config.vmodule, "logger configured");
        Ok(())
    }

    // ---- verbosity ----

    pub fn verbosity(&self) -> &Verbosity {
        &self.inner.verbosity
    }

    pub fn set_level(&self, level: Level) {
        self.inner.verbosity.set_level(level);
    }

    /// Replace the pattern overrides with a `pattern=N,...` list.
    pub fn set_vmodule(&self, spec: &str) -> Result<()> {
        self.inner.verbosity.set_vmodule(spec)
    }

    pub fn set_backtrace_at(&self, location: &str) -> Result<()> {
        self.inner.verbosity.set_backtrace_at(location)
    }

    /// Whether verbosity `level` is enabled at the caller's location.
    #[track_caller]
    #[inline]
    pub fn v(&self, level: Level) -> bool {
        self.inner.verbosity.check_v(level, Location::caller())
    }

    // ---- output routing ----

    pub fn set_to_stderr(&self, on: bool) {
        self.inner.to_stderr.store(on, Ordering::Relaxed);
    }

    pub fn set_also_to_stderr(&self, on: bool) {
        self.inner.also_to_stderr.store(on, Ordering::Relaxed);
    }

    pub fn set_stderr_threshold(&self, sev: Severity) {
        self.inner.stderr_threshold.store(sev as u8, Ordering::Relaxed);
    }

    pub fn stderr_threshold(&self) -> Severity {
        self.inner.stderr_threshold()
    }

    pub fn set_max_size(&self, max_size: u64) {
        self.inner.files.set_max_size(max_size);
    }

    // ---- sinks ----

    pub fn register_sink(&self, sink: Arc<dyn Sink>) {
        self.inner.dispatcher.register(sink);
    }

    /// Swap the whole structured sink list, returning the old one.
    pub fn replace_sinks(&self, sinks: SinkList) -> Arc<SinkList> {
        self.inner.dispatcher.replace(sinks)
    }

    pub fn register_text_sink(&self, sink: Arc<dyn TextSink>) {
        self.inner.text_sinks.rcu(|current| {
            let mut next = TextSinkList::clone(current);
            next.push(Arc::clone(&sink));
            next
        });
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    // ---- logging ----

    /// Log at `sev` from the caller's location.
    #[track_caller]
    pub fn log(&self, sev: Severity, args: fmt::Arguments<'_>) -> Result<usize> {
        let loc = Location::caller();
        self.log_at(sev, loc.file(), loc.line(), args)
    }

    /// Log at `sev` as if called from `file:line`.
    pub fn log_at(&self, sev: Severity, file: &'static str, line: u32, args: fmt::Arguments<'_>) -> Result<usize> {
        self.log_meta(Meta::new(sev, self.inner.clock.now(), file, line), args)
    }

    /// Log at `sev` from the caller's location, recording that the caller is
    /// `depth` wrapper frames away from the code the record is about.
    /// Wrappers mark themselves `#[track_caller]` so the location they
    /// report is the code that called them.
    #[track_caller]
    pub fn log_depth(&self, sev: Severity, depth: usize, args: fmt::Arguments<'_>) -> Result<usize> {
        let loc = Location::caller();
        let meta = Meta::new(sev, self.inner.clock.now(), loc.file(), loc.line()).with_depth(depth);
        self.log_meta(meta, args)
    }

    /// Log a record whose metadata the caller assembled.
    pub fn log_meta(&self, meta: Meta, args: fmt::Arguments<'_>) -> Result<usize> {
        self.write(meta, args, FatalKind::Fatal)
    }

    /// Log a FATAL record and exit with code 1, without the stack dump.
    #[track_caller]
    pub fn exit(&self, args: fmt::Arguments<'_>) -> Result<usize> {
        let loc = Location::caller();
        let meta = Meta::new(Severity::Fatal, self.inner.clock.now(), loc.file(), loc.line());
        self.write(meta, args, FatalKind::Exit)
    }

    fn write(&self, mut meta: Meta, args: fmt::Arguments<'_>, kind: FatalKind) -> Result<usize> {
        let inner = &*self.inner;
        let fatal = meta.severity == Severity::Fatal;
        if fatal && !inner.fatal.enter() {
            inner.fatal.wait();
            return Ok(0);
        }

        let traced = meta.stack.is_none() && inner.verbosity.backtrace_at(meta.file, meta.line);
        if traced {
            meta.stack = Some(Arc::new(Stack::capture()));
        }

        let mut buf = inner.pool.get();
        let trailer = if traced { meta.stack.as_deref().map(Stack::as_str) } else { None };
        format_record(&mut buf, &meta, args, trailer);

        let (written, text_err) = inner.write_text(&meta, &buf);
        if written > 0 {
            inner.stats.record(meta.severity, buf.len());
        }
        let dispatched = inner.dispatcher.dispatch(&mut meta, args);

        if fatal {
            inner.finish_fatal(&meta, &buf, kind);
        }
        match (text_err, dispatched) {
            (None, Ok(n)) => Ok(written.max(n)),
            (Some(e), _) | (None, Err(e)) => Err(e),
        }
    }

    // ---- queries ----

    /// Log files written for `sev`, oldest first.
    pub fn names(&self, sev: Severity) -> Result<Vec<PathBuf>> {
        self.inner.files.names(sev)
    }

    pub fn stats(&self) -> &Stats {
        &self.inner.stats
    }

    pub fn fatal_message(&self) -> Option<FatalMessage> {
        self.inner.fatal.message()
    }

    pub fn fatal_state(&self) -> FatalState {
        self.inner.fatal.state()
    }

    pub fn set_exit_hook(&self, hook: ExitHook) {
        self.inner.fatal.set_exit_hook(hook);
    }

    // ---- lifecycle ----

    /// Flush files and stderr now.
    pub fn flush(&self) -> Result<()> {
        Flush::flush(&*self.inner)
    }

    /// Flush and fsync every open file.
    pub fn sync(&self) -> Result<()> {
        self.inner.files.sync()
    }

    /// Start the periodic flusher. Does nothing if it is already running.
    pub fn start_flush_daemon(&self) -> Result<()> {
        let mut slot = self.inner.daemon.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(FlushDaemon::spawn(self.inner.flush_interval, Arc::downgrade(&self.inner))?);
        }
        Ok(())
    }

    pub fn flush_daemon_running(&self) -> bool {
        self.inner.daemon.lock().unwrap_or_else(|e| e.into_inner()).as_ref().is_some_and(FlushDaemon::is_running)
    }

    /// Stop the flush daemon and sync everything. Logging keeps working.
    pub fn shutdown(&self) -> Result<()> {
        let daemon = self.inner.daemon.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut daemon) = daemon {
            daemon.stop();
        }
        let result = self.sync().and(self.flush());
        if let Err(e) = &result {
            warn!("shutdown flush failed: {e}");
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::thread;

    use super::*;
    use crate::{
        clock::ManualClock,
        dispatch::tests::RecordingSink,
        file_sink::{MemoryWriter, SeverityWriter},
        header::MAX_LOG_MESSAGE_LEN,
        platform,
    };

    pub(crate) struct Harness {
        pub logger: Logger,
        pub files: Vec<MemoryWriter>,
        pub stderr: MemoryWriter,
        pub exits: Arc<Mutex<Vec<i32>>>,
    }

    impl Harness {
        pub(crate) fn file(&self, sev: Severity) -> String {
            self.files[sev.index()].contents()
        }

        pub(crate) fn exits(&self) -> Vec<i32> {
            self.exits.lock().unwrap().clone()
        }
    }

    pub(crate) fn harness_with(config: LogConfig) -> Harness {
        let files: Vec<MemoryWriter> = (0..Severity::COUNT).map(|_| MemoryWriter::new()).collect();
        let stderr = MemoryWriter::new();
        let exits = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&exits);
        let hook: ExitHook = Arc::new(move |code: i32| recorded.lock().unwrap().push(code));
        let logger = Logger::builder()
            .config(config)
            .clock(Arc::new(ManualClock::at(2024, 12, 23, 1, 23, 45, 678_901)))
            .stderr(Box::new(stderr.clone()))
            .exit_hook(hook)
            .file_writers(std::array::from_fn(|i| Some(Box::new(files[i].clone()) as Box<dyn SeverityWriter>)))
            .build()
            .unwrap();
        Harness { logger, files, stderr, exits }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(LogConfig::default())
    }

    fn v_here(logger: &Logger, level: Level) -> bool {
        logger.v(level)
    }

    #[test]
    fn line_format() {
        let h = harness();
        h.logger.log_at(Severity::Info, "src/net/server.rs", 42, format_args!("listening on {}", 8080)).unwrap();
        let want = format!("I1223 01:23:45.678901 {:>7} server.rs:42] listening on 8080\n", platform::pid());
        assert_eq!(h.file(Severity::Info), want);
    }

    #[test]
    fn writes_cascade_down_only() {
        let h = harness();
        h.logger.log(Severity::Info, format_args!("info")).unwrap();
        h.logger.log(Severity::Warning, format_args!("warning")).unwrap();
        h.logger.log(Severity::Error, format_args!("error")).unwrap();

        let info = h.file(Severity::Info);
        let warning = h.file(Severity::Warning);
        let error = h.file(Severity::Error);
        assert_eq!(info.lines().count(), 3);
        assert_eq!(warning.lines().count(), 2);
        assert_eq!(error.lines().count(), 1);
        assert!(!warning.contains("] info"));
        assert!(!error.contains("] warning"));
        assert_eq!(h.file(Severity::Fatal), "");

        // Same bytes everywhere, including the header.
        let error_line = error.lines().next().unwrap();
        assert!(error_line.starts_with('E'));
        assert!(info.lines().any(|l| l == error_line));
        assert!(warning.lines().any(|l| l == error_line));
    }

    #[test]
    fn stderr_routing() {
        let h = harness();
        h.logger.log(Severity::Warning, format_args!("quiet")).unwrap();
        h.logger.log(Severity::Error, format_args!("loud")).unwrap();
        let stderr = h.stderr.contents();
        assert!(!stderr.contains("quiet"));
        assert!(stderr.contains("] loud\n"));

        h.stderr.clear();
        h.logger.set_stderr_threshold(Severity::Warning);
        h.logger.log(Severity::Warning, format_args!("now loud")).unwrap();
        assert!(h.stderr.contents().contains("now loud"));

        h.stderr.clear();
        h.logger.set_also_to_stderr(true);
        h.logger.log(Severity::Info, format_args!("both")).unwrap();
        assert!(h.stderr.contents().contains("both"));
        assert!(h.file(Severity::Info).contains("both"));

        h.logger.set_to_stderr(true);
        h.logger.log(Severity::Info, format_args!("stderr only")).unwrap();
        assert!(h.stderr.contents().contains("stderr only"));
        assert!(!h.file(Severity::Info).contains("stderr only"));
    }

    #[test]
    fn stats_count_own_severity() {
        let h = harness();
        let n = h.logger.log(Severity::Error, format_args!("x")).unwrap();
        h.logger.log(Severity::Info, format_args!("y")).unwrap();
        let stats = h.logger.stats();
        assert_eq!(stats.error.lines(), 1);
        assert_eq!(stats.error.bytes(), n as i64);
        assert_eq!(stats.warning.lines(), 0);
        assert_eq!(stats.info.lines(), 1);
    }

    #[test]
    fn global_level() {
        let h = harness();
        let l = &h.logger;
        assert!(v_here(l, 0));
        assert!(!v_here(l, 1));
        l.set_level(2);
        assert!(v_here(l, 1));
        assert!(v_here(l, 2));
        assert!(!v_here(l, 3));
        // A call site never seen before behaves the same.
        assert!(l.v(2) && !l.v(3));
    }

    #[test]
    fn star_pattern_example() {
        let h = harness();
        let l = &h.logger;
        l.set_vmodule("*=2").unwrap();
        assert!(v_here(l, 2));
        assert!(!v_here(l, 3));
        l.set_vmodule("").unwrap();
        l.set_level(3);
        assert!(v_here(l, 3));
        assert!(l.v(3));
    }

    #[test]
    fn pattern_change_is_seen_immediately() {
        let h = harness();
        let l = &h.logger;
        l.set_vmodule("logger=3").unwrap();
        assert!(v_here(l, 3));
        assert!(l.verbosity().cached_sites() > 0);
        l.set_vmodule("logger=1").unwrap();
        assert!(!v_here(l, 3));
        assert!(v_here(l, 1));
        l.set_vmodule("other=5").unwrap();
        assert!(!v_here(l, 1));
    }

    #[test]
    fn bad_vmodule_keeps_old_rules() {
        let h = harness();
        h.logger.set_vmodule("logger=2").unwrap();
        assert!(h.logger.set_vmodule("logger=x").is_err());
        assert!(v_here(&h.logger, 2));
    }

    #[test]
    fn backtrace_at_location() {
        let h = harness();
        let sink = Arc::new(RecordingSink::default());
        h.logger.register_sink(sink.clone());
        h.logger.set_backtrace_at("trigger.rs:7").unwrap();
        h.logger.log_at(Severity::Info, "src/trigger.rs", 7, format_args!("here")).unwrap();
        h.logger.log_at(Severity::Info, "src/trigger.rs", 8, format_args!("not here")).unwrap();
        let info = h.file(Severity::Info);
        let (first, second) = info.split_once("] not here").unwrap();
        assert!(first.contains("] here\nthread '"));
        assert!(first.contains("[running]"));
        assert_eq!(second, "\n");
        let calls = sink.calls();
        assert!(calls[0].0.stack.is_some());
        assert!(calls[1].0.stack.is_none());
        assert_eq!(h.logger.dispatcher().stack_captures(), 0);
    }

    #[test]
    fn one_stack_for_three_sinks() {
        let h = harness();
        let sinks: Vec<Arc<RecordingSink>> = [None, Some(true), Some(false)]
            .into_iter()
            .map(|w| Arc::new(RecordingSink { wants_stack: w, ..Default::default() }))
            .collect();
        for s in &sinks {
            h.logger.register_sink(s.clone());
        }
        h.logger.log(Severity::Warning, format_args!("needs a stack")).unwrap();
        assert_eq!(h.logger.dispatcher().stack_captures(), 1);
        let stacks: Vec<Arc<Stack>> = sinks.iter().map(|s| s.calls()[0].0.stack.clone().unwrap()).collect();
        assert!(Arc::ptr_eq(&stacks[0], &stacks[1]));
        assert!(Arc::ptr_eq(&stacks[1], &stacks[2]));
        // Structured stacks stay out of the text output.
        assert!(!h.file(Severity::Info).contains("[running]"));
    }

    #[test]
    fn sink_error_is_returned_but_nothing_is_lost() {
        let h = harness();
        let bad = Arc::new(RecordingSink { fail: true, id: 1, ..Default::default() });
        let good = Arc::new(RecordingSink { id: 2, ..Default::default() });
        h.logger.register_sink(bad.clone());
        h.logger.register_sink(good.clone());
        let err = h.logger.log(Severity::Info, format_args!("still written")).unwrap_err();
        assert!(matches!(err, LogError::Sink(_)));
        assert!(h.file(Severity::Info).contains("still written"));
        assert_eq!(good.calls()[0].1, "still written");
        assert_eq!(h.logger.stats().info.lines(), 1);
    }

    #[test]
    fn caller_context_reaches_every_sink() {
        let h = harness();
        let sinks: Vec<Arc<RecordingSink>> =
            (1..=2).map(|id| Arc::new(RecordingSink { id, ..Default::default() })).collect();
        for s in &sinks {
            h.logger.register_sink(s.clone());
        }
        let context: crate::dispatch::Context = Arc::new(String::from("request 7"));
        let meta = Meta::new(Severity::Info, h.logger.inner.clock.now(), file!(), line!())
            .with_context(Arc::clone(&context));
        h.logger.log_meta(meta, format_args!("with context")).unwrap();
        h.logger.log(Severity::Info, format_args!("without")).unwrap();

        for s in &sinks {
            let calls = s.calls();
            let seen = calls[0].0.context.as_ref().unwrap();
            assert!(Arc::ptr_eq(seen, &context));
            assert_eq!(seen.downcast_ref::<String>().unwrap(), "request 7");
            assert!(calls[1].0.context.is_none());
        }
        assert!(h.file(Severity::Info).contains("] with context\n"));
    }

    #[track_caller]
    fn wrapped_log(logger: &Logger, msg: &str) -> Result<usize> {
        logger.log_depth(Severity::Warning, 1, format_args!("{msg}"))
    }

    #[test]
    fn log_depth_reports_the_wrapper_caller() {
        let h = harness();
        let sink = Arc::new(RecordingSink::default());
        h.logger.register_sink(sink.clone());
        let line = line!() + 1;
        wrapped_log(&h.logger, "through a wrapper").unwrap();
        let (meta, msg) = &sink.calls()[0];
        assert_eq!(msg, "through a wrapper");
        assert_eq!(meta.depth, 1);
        assert_eq!(meta.line, line);
        assert!(h.file(Severity::Warning).contains(&format!("logger.rs:{line}] through a wrapper")));
        h.logger.log(Severity::Info, format_args!("direct")).unwrap();
        assert_eq!(sink.calls()[1].0.depth, 0);
    }

    #[test]
    fn partial_file_failure_still_counts() {
        let dir = tempfile::tempdir().unwrap();
        let stderr = MemoryWriter::new();
        let info = MemoryWriter::new();
        let logger = Logger::builder()
            .stderr(Box::new(stderr.clone()))
            .log_dirs(vec![dir.path().join("missing")])
            .file_writers([Some(Box::new(info.clone()) as Box<dyn SeverityWriter>), None, None, None])
            .build()
            .unwrap();
        let err = logger.log(Severity::Warning, format_args!("half written")).unwrap_err();
        assert!(matches!(err, LogError::File { .. }));
        assert!(info.contents().ends_with("] half written\n"));
        assert!(stderr.contents().starts_with("sevlog: log file error: "));
        assert_eq!(logger.stats().warning.lines(), 1);
    }

    #[test]
    fn long_message_truncated() {
        let h = harness();
        let long = "x".repeat(MAX_LOG_MESSAGE_LEN * 2);
        h.logger.log(Severity::Info, format_args!("{long}")).unwrap();
        let stored = h.file(Severity::Info);
        assert_eq!(stored.len(), MAX_LOG_MESSAGE_LEN);
        assert!(stored.ends_with('\n'));
    }

    #[test]
    fn fatal_sequence() {
        let h = harness();
        h.logger.log(Severity::Fatal, format_args!("giving up")).unwrap();
        assert_eq!(h.exits(), vec![255]);
        assert_eq!(h.logger.fatal_state(), FatalState::Terminated);
        for sev in Severity::ALL {
            let text = h.file(sev);
            assert!(text.contains("] giving up\n"), "{sev}");
            assert!(text.contains("[running]"), "{sev}");
        }
        let stderr = h.stderr.contents();
        assert!(stderr.starts_with('F'));
        assert!(stderr.contains("[running]"));
        let msg = h.logger.fatal_message().unwrap();
        assert!(msg.line.ends_with("] giving up\n"));
        assert_eq!(msg.meta.severity, Severity::Fatal);
        assert!(h.logger.stats().get(Severity::Fatal).is_none());
    }

    #[test]
    fn exit_skips_stack_dump() {
        let h = harness();
        h.logger.exit(format_args!("bye")).unwrap();
        assert_eq!(h.exits(), vec![1]);
        assert!(h.file(Severity::Fatal).contains("] bye\n"));
        assert!(!h.file(Severity::Fatal).contains("[running]"));
        assert!(!h.stderr.contents().contains("[running]"));
    }

    #[test]
    fn concurrent_fatals_run_once() {
        let h = harness();
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let logger = h.logger.clone();
                thread::spawn(move || logger.log(Severity::Fatal, format_args!("fatal from {i}")).unwrap())
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(h.exits(), vec![255]);
        let fatal = h.file(Severity::Fatal);
        assert_eq!(fatal.matches("] fatal from ").count(), 1);
        assert_eq!(fatal.matches("[running]").count(), 1);
        assert_eq!(h.stderr.contents().matches("] fatal from ").count(), 1);
    }

    #[test]
    fn file_errors_are_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let stderr = MemoryWriter::new();
        let logger = Logger::builder()
            .stderr(Box::new(stderr.clone()))
            .log_dirs(vec![dir.path().join("missing")])
            .build()
            .unwrap();
        let err = logger.log(Severity::Info, format_args!("lost")).unwrap_err();
        assert!(matches!(err, LogError::File { .. }));
        assert!(stderr.contents().starts_with("sevlog: log file error: "));
        assert_eq!(logger.stats().info.lines(), 0);
        assert_eq!(logger.fatal_state(), FatalState::Normal);
        assert!(matches!(logger.names(Severity::Info), Err(LogError::NoLog)));
    }

    #[test]
    fn real_files_and_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig { flush_interval_secs: Some(1), ..Default::default() };
        let logger = Logger::builder().config(config).log_dirs(vec![dir.path().to_path_buf()]).build().unwrap();
        logger.start_flush_daemon().unwrap();
        logger.start_flush_daemon().unwrap();
        assert!(logger.flush_daemon_running());
        logger.log(Severity::Warning, format_args!("on disk")).unwrap();
        logger.shutdown().unwrap();
        assert!(!logger.flush_daemon_running());

        let names = logger.names(Severity::Info).unwrap();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with(dir.path()));
        assert!(std::fs::read_to_string(&names[0]).unwrap().contains("] on disk\n"));
        assert!(matches!(logger.names(Severity::Error), Err(LogError::NoLog)));
    }

    #[test]
    fn apply_rejects_without_side_effects() {
        let h = harness();
        let bad = LogConfig { v: Some(4), stderrthreshold: Some("NOPE".into()), ..Default::default() };
        assert!(h.logger.apply(&bad).is_err());
        assert_eq!(h.logger.verbosity().level(), 0);
        let good = LogConfig { v: Some(4), stderrthreshold: Some("INFO".into()), ..Default::default() };
        h.logger.apply(&good).unwrap();
        assert_eq!(h.logger.verbosity().level(), 4);
        assert_eq!(h.logger.stderr_threshold(), Severity::Info);
    }
}
