//! Rotating, buffered log files, one per severity.
//!
//! A record written at severity `S` is appended to the file for `S` and to the
//! files of every less severe level, all under one lock, so each file holds
//! the complete stream at or above its own severity and rotations never
//! interleave with a half-written cascade.
//!
//! # File names
//!
//! ```text
//! <program>.<host>.<user>.log.<SEVERITY>.<YYYYMMDD-HHMMSS>.<pid>[.<n>]
//! ```
//!
//! Files are created with `create_new`, so two writers never share a file.
//! When the name for this second is already taken on disk (a rotation, a
//! reopen after [`FileSink::close`], another sink in the same directory),
//! `.1`, `.2`, ... are appended until a free name is found.
//!
//! # Rotation
//!
//! A file is rotated when the incoming record would push it past the size
//! limit, or when the local date has changed since the file was opened. The
//! old file gets a footer naming its successor; the new file's header names
//! its predecessor.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Local, NaiveDate};

use crate::{
    clock::Clock,
    error::{LogError, Result},
    platform,
    severity::Severity,
};

/// Default size limit of one log file (1800 MiB).
pub const DEFAULT_MAX_SIZE: u64 = 1024 * 1024 * 1800;

/// Marker written to a rotated file right before the `Next log:` line.
pub const FOOTER: &str = "\nCONTINUED in next file\n";

const BUFFER_SIZE: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// The identity baked into every log file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    pub program: String,
    /// Short host name (up to the first dot).
    pub host: String,
    /// Full host name, printed in file headers.
    pub full_host: String,
    pub user: String,
    pub pid: u64,
}

impl FileIdentity {
    /// Identity of the running process.
    pub fn detect() -> Self {
        let full_host = platform::hostname();
        Self {
            program: platform::program_name(),
            host: platform::short_hostname(&full_host).to_string(),
            full_host,
            user: platform::user_name(),
            pid: platform::pid(),
        }
    }

    /// File name for a log of `sev` opened at `t`, without any suffix.
    pub fn file_name(&self, sev: Severity, t: &DateTime<Local>) -> String {
        format!(
            "{}.{}.{}.log.{}.{}.{}",
            self.program,
            self.host,
            self.user,
            sev.name(),
            t.format("%Y%m%d-%H%M%S"),
            self.pid
        )
    }
}

/// Where and how log files are created.
#[derive(Debug, Clone)]
pub struct FileSinkConfig {
    /// Candidate directories; the first that accepts a new file is used.
    pub dirs: Vec<PathBuf>,
    pub max_size: u64,
    pub identity: FileIdentity,
    /// Maintain a `<program>.<SEVERITY>` symlink to the newest file.
    pub symlinks: bool,
}

// ---------------------------------------------------------------------------
// File creation
// ---------------------------------------------------------------------------

/// Exclusively create the next log file for `sev`.
///
/// A name that exists on disk or appears in `used` gets the next numeric
/// suffix in the same directory. Any other failure moves on to the next
/// directory; the last such error is returned if none accepts the file.
pub fn create(config: &FileSinkConfig, sev: Severity, now: &DateTime<Local>, used: &[PathBuf]) -> Result<(File, PathBuf)> {
    let base = config.identity.file_name(sev, now);
    let mut last_err = None;
    for dir in &config.dirs {
        let mut n = 0u32;
        loop {
            let candidate = if n == 0 { dir.join(&base) } else { dir.join(format!("{base}.{n}")) };
            n += 1;
            if used.contains(&candidate) {
                continue;
            }
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(file) => {
                    if config.symlinks {
                        update_symlink(dir, &config.identity.program, sev, &candidate);
                    }
                    return Ok((file, candidate));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    last_err = Some(LogError::file(candidate, e));
                    break;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| LogError::Config("no log directory configured".into())))
}

#[cfg(unix)]
fn update_symlink(dir: &Path, program: &str, sev: Severity, target: &Path) {
    let Some(name) = target.file_name() else {
        return;
    };
    let link = dir.join(format!("{program}.{}", sev.name()));
    let _ = std::fs::remove_file(&link);
    if let Err(e) = std::os::unix::fs::symlink(name, &link) {
        tracing::debug!("cannot update symlink {}: {e}", link.display());
    }
}

#[cfg(not(unix))]
fn update_symlink(_dir: &Path, _program: &str, _sev: Severity, _target: &Path) {}

// ---------------------------------------------------------------------------
// SeverityWriter
// ---------------------------------------------------------------------------

/// Destination for one severity's records.
pub trait SeverityWriter: Send {
    /// Start a new file if a record of `incoming` bytes at `now` calls for
    /// it. On error the writer keeps its current file.
    fn rotate_if_needed(&mut self, _now: &DateTime<Local>, _incoming: usize, _max_size: u64) -> Result<()> {
        Ok(())
    }

    /// Append one record.
    fn write_record(&mut self, data: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Flush and ask the OS to persist.
    fn sync(&mut self) -> Result<()>;

    /// Every file this writer has used, oldest first.
    fn names(&self) -> Vec<PathBuf>;
}

/// A log file that rotates by size and by date.
pub struct RotatingFile {
    sev: Severity,
    config: Arc<FileSinkConfig>,
    writer: BufWriter<File>,
    path: PathBuf,
    /// Bytes written since the last rotation, header included.
    nbytes: u64,
    day: NaiveDate,
    names: Vec<PathBuf>,
}

impl RotatingFile {
    pub fn open(sev: Severity, config: Arc<FileSinkConfig>, now: &DateTime<Local>) -> Result<Self> {
        let (file, path) = create(&config, sev, now, &[])?;
        let mut rf = Self {
            sev,
            config,
            writer: BufWriter::with_capacity(BUFFER_SIZE, file),
            names: vec![path.clone()],
            path,
            nbytes: 0,
            day: now.date_naive(),
        };
        rf.write_header(now, None)?;
        Ok(rf)
    }

    fn needs_rotation(&self, now: &DateTime<Local>, incoming: usize, max_size: u64) -> bool {
        self.nbytes + incoming as u64 > max_size || now.date_naive() != self.day
    }

    /// Close the current file with a footer and continue in a new one.
    pub fn rotate(&mut self, now: &DateTime<Local>) -> Result<()> {
        let (file, path) = create(&self.config, self.sev, now, &self.names)?;
        let footer = format!("{FOOTER}Next log: {}\n", path.display());
        let finished = self.writer.write_all(footer.as_bytes()).and_then(|()| self.writer.flush());
        let previous = std::mem::replace(&mut self.path, path.clone());
        // Dropping the old writer closes the file.
        drop(std::mem::replace(&mut self.writer, BufWriter::with_capacity(BUFFER_SIZE, file)));
        self.names.push(path);
        self.nbytes = 0;
        self.day = now.date_naive();
        let header = self.write_header(now, Some(&previous));
        finished.map_err(|e| LogError::file(&previous, e))?;
        header
    }

    fn write_header(&mut self, now: &DateTime<Local>, previous: Option<&Path>) -> Result<()> {
        let previous = previous.map_or_else(|| "<none>".to_string(), |p| p.display().to_string());
        let header = format!(
            "Log file created at: {}\n\
             Running on machine: {}\n\
             Binary: Built with rustc for {}/{}\n\
             Previous log: {previous}\n\
             Log line format: [IWEF]mmdd hh:mm:ss.uuuuuu threadid file:line] msg\n",
            now.format("%Y/%m/%d %H:%M:%S"),
            self.config.identity.full_host,
            std::env::consts::OS,
            std::env::consts::ARCH,
        );
        self.writer.write_all(header.as_bytes()).map_err(|e| LogError::file(&self.path, e))?;
        self.nbytes += header.len() as u64;
        Ok(())
    }
}

impl SeverityWriter for RotatingFile {
    fn rotate_if_needed(&mut self, now: &DateTime<Local>, incoming: usize, max_size: u64) -> Result<()> {
        if self.needs_rotation(now, incoming, max_size) { self.rotate(now) } else { Ok(()) }
    }

    fn write_record(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).map_err(|e| LogError::file(&self.path, e))?;
        self.nbytes += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| LogError::file(&self.path, e))
    }

    fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.writer.get_ref().sync_all().map_err(|e| LogError::file(&self.path, e))
    }

    fn names(&self) -> Vec<PathBuf> {
        self.names.clone()
    }
}

/// In-memory writer, shareable with the code that inspects it.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap_or_else(|e| e.into_inner())).into_owned()
    }

    pub fn clear(&self) {
        self.buf.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl SeverityWriter for MemoryWriter {
    fn write_record(&mut self, data: &[u8]) -> Result<()> {
        self.buf.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn names(&self) -> Vec<PathBuf> {
        vec![PathBuf::from("<memory>")]
    }
}

/// Lets a `MemoryWriter` stand in for stderr.
impl Write for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileSink
// ---------------------------------------------------------------------------

pub type Writers = [Option<Box<dyn SeverityWriter>>; Severity::COUNT];

/// Outcome of one cascaded write.
#[derive(Debug, Default)]
pub struct Written {
    /// Files that took the record.
    pub files: usize,
    /// Files that could not be opened, rotated or written, in cascade order.
    /// A failed rotation still leaves the record in the current file.
    pub errors: Vec<LogError>,
}

impl Written {
    pub fn landed(&self) -> bool {
        self.files > 0
    }
}

/// The per-severity file group.
pub struct FileSink {
    config: Arc<FileSinkConfig>,
    max_size: AtomicU64,
    clock: Arc<dyn Clock>,
    files: Mutex<Writers>,
}

impl FileSink {
    pub fn new(config: FileSinkConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_size: AtomicU64::new(config.max_size),
            config: Arc::new(config),
            clock,
            files: Mutex::new(std::array::from_fn(|_| None)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Writers> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &FileSinkConfig {
        &self.config
    }

    pub fn max_size(&self) -> u64 {
        self.max_size.load(Ordering::Relaxed)
    }

    /// Change the size limit; applies to the next write.
    pub fn set_max_size(&self, max_size: u64) {
        self.max_size.store(max_size, Ordering::Relaxed);
    }

    /// Write `data` to the file for `sev` and every less severe file.
    ///
    /// Missing files are created first. A file that cannot be opened or
    /// rotated does not keep the record from the others.
    pub fn write(&self, sev: Severity, data: &[u8]) -> Written {
        let now = self.clock.now();
        let max_size = self.max_size();
        let mut files = self.lock();
        let mut written = Written::default();
        for target in sev.cascade() {
            let slot = &mut files[target.index()];
            if slot.is_none() {
                match RotatingFile::open(target, Arc::clone(&self.config), &now) {
                    Ok(rf) => *slot = Some(Box::new(rf)),
                    Err(e) => {
                        written.errors.push(e);
                        continue;
                    }
                }
            }
            let Some(w) = slot.as_mut() else {
                continue;
            };
            if let Err(e) = w.rotate_if_needed(&now, data.len(), max_size) {
                written.errors.push(e);
            }
            match w.write_record(data) {
                Ok(()) => written.files += 1,
                Err(e) => written.errors.push(e),
            }
        }
        written
    }

    /// Flush every open file; first error wins, all files are attempted.
    pub fn flush(&self) -> Result<()> {
        self.each_open(|w| w.flush())
    }

    /// Flush and fsync every open file.
    pub fn sync(&self) -> Result<()> {
        self.each_open(|w| w.sync())
    }

    fn each_open(&self, mut op: impl FnMut(&mut dyn SeverityWriter) -> Result<()>) -> Result<()> {
        let mut files = self.lock();
        let mut first_err = None;
        for w in files.iter_mut().flatten() {
            if let Err(e) = op(w.as_mut()) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Files written for `sev` so far, oldest first.
    pub fn names(&self, sev: Severity) -> Result<Vec<PathBuf>> {
        self.lock()[sev.index()].as_ref().map(|w| w.names()).ok_or(LogError::NoLog)
    }

    /// Install new writers, returning the old ones unflushed.
    pub fn swap(&self, writers: Writers) -> Writers {
        std::mem::replace(&mut *self.lock(), writers)
    }

    /// Flush and drop every open file. The next write starts new files.
    pub fn close(&self) -> Result<()> {
        let result = self.flush();
        drop(self.swap(std::array::from_fn(|_| None)));
        result
    }
}
