//! Line header formatting and the reusable buffer pool.
//!
//! Every formatted record starts with a fixed-layout header:
//!
//! ```text
//! Lmmdd hh:mm:ss.uuuuuu threadid file:line] msg
//! I0102 15:04:05.067890    1234 server.rs:42] listening
//! ```
//!
//! Numeric fields go through [`push_digits`] instead of `fmt` machinery; the
//! header is written on every log call and formatting integers by hand keeps it
//! off the profile.

use std::{
    fmt,
    io::Write,
    ops::{Deref, DerefMut},
    sync::Mutex,
};

use chrono::{Datelike, Timelike};

use crate::{dispatch::Meta, level::base_name};

/// Maximum length of one formatted record, header and final newline included.
pub const MAX_LOG_MESSAGE_LEN: usize = 15_000;

/// Buffers that grew beyond this are dropped instead of pooled.
const MAX_POOLED_CAPACITY: usize = 256 * 1024;

/// Spare buffers kept around between calls.
const MAX_POOLED_BUFFERS: usize = 64;

// ---------------------------------------------------------------------------
// Digits
// ---------------------------------------------------------------------------

/// Append `n` in decimal, left-padded with `pad` to at least `width` bytes.
#[inline]
pub fn push_digits(buf: &mut Vec<u8>, mut n: u64, width: usize, pad: u8) {
    let mut digits = [0u8; 20];
    let mut i = digits.len();
    loop {
        i -= 1;
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    let len = digits.len() - i;
    buf.extend(std::iter::repeat_n(pad, width.saturating_sub(len)));
    buf.extend_from_slice(&digits[i..]);
}

// ---------------------------------------------------------------------------
// Header / record
// ---------------------------------------------------------------------------

/// Append the header for `meta` to `buf`.
pub fn format_header(buf: &mut Vec<u8>, meta: &Meta) {
    let t = &meta.time;
    buf.push(meta.severity.as_char());
    push_digits(buf, u64::from(t.month()), 2, b'0');
    push_digits(buf, u64::from(t.day()), 2, b'0');
    buf.push(b' ');
    push_digits(buf, u64::from(t.hour()), 2, b'0');
    buf.push(b':');
    push_digits(buf, u64::from(t.minute()), 2, b'0');
    buf.push(b':');
    push_digits(buf, u64::from(t.second()), 2, b'0');
    buf.push(b'.');
    // nanosecond() exceeds 1e9 during a leap second.
    push_digits(buf, u64::from(t.nanosecond() / 1_000 % 1_000_000), 6, b'0');
    buf.push(b' ');
    push_digits(buf, meta.thread, 7, b' ');
    buf.push(b' ');
    buf.extend_from_slice(base_name(meta.file).as_bytes());
    buf.push(b':');
    push_digits(buf, u64::from(meta.line), 0, b' ');
    buf.extend_from_slice(b"] ");
}

/// Append a complete record: header, message, optional trailer (a stack
/// trace), final newline. The result never exceeds [`MAX_LOG_MESSAGE_LEN`].
pub fn format_record(buf: &mut Vec<u8>, meta: &Meta, args: fmt::Arguments<'_>, trailer: Option<&str>) {
    let start = buf.len();
    format_header(buf, meta);
    // A failing Display impl leaves whatever it wrote so far.
    let _ = buf.write_fmt(args);
    if let Some(trailer) = trailer {
        if buf.last() != Some(&b'\n') {
            buf.push(b'\n');
        }
        buf.extend_from_slice(trailer.as_bytes());
    }
    finish_line(buf, start);
}

/// Enforce the length limit and the trailing newline for the record that
/// starts at `start`.
fn finish_line(buf: &mut Vec<u8>, start: usize) {
    if buf.len() - start >= MAX_LOG_MESSAGE_LEN {
        buf.truncate(start + MAX_LOG_MESSAGE_LEN - 1);
        buf.push(b'\n');
    } else if buf.last() != Some(&b'\n') {
        buf.push(b'\n');
    }
}

// ---------------------------------------------------------------------------
// BufferPool
// ---------------------------------------------------------------------------

/// Pool of formatting buffers.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a cleared buffer; it goes back to the pool when the guard drops.
    pub fn get(&self) -> PooledBuffer<'_> {
        let buf = self.free.lock().unwrap_or_else(|e| e.into_inner()).pop().unwrap_or_default();
        PooledBuffer { buf, pool: self }
    }

    /// Buffers currently waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < MAX_POOLED_BUFFERS {
            free.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer<'a> {
    buf: Vec<u8>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        severity::Severity,
    };

    fn meta(sev: Severity, thread: u64) -> Meta {
        let time = ManualClock::at(2006, 1, 2, 15, 4, 5, 67_890).now();
        let mut m = Meta::new(sev, time, "src/bin/header_test.rs", 1234);
        m.thread = thread;
        m
    }

    fn record(m: &Meta, args: fmt::Arguments<'_>) -> String {
        let mut buf = Vec::new();
        format_record(&mut buf, m, args, None);
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn header_layout() {
        let m = meta(Severity::Info, 1234);
        assert_eq!(record(&m, format_args!("testHeader")), "I0102 15:04:05.067890    1234 header_test.rs:1234] testHeader\n");
        let m = meta(Severity::Error, 7);
        assert!(record(&m, format_args!("x")).starts_with("E0102 15:04:05.067890       7 header_test.rs:1234] x"));
    }

    #[test]
    fn thread_id_padding() {
        let cases: [(u64, &str); 6] = [
            (1, "       1 "),
            (912_389, "  912389 "),
            (1_234_567, " 1234567 "),
            (2_147_483_648, " 2147483648 "),
            (9_223_372_036_854_775_808, " 9223372036854775808 "),
            (u64::MAX - 1, " 18446744073709551614 "),
        ];
        for (id, want) in cases {
            let line = record(&meta(Severity::Info, id), format_args!("DOOMBAH!"));
            assert!(line.contains(want), "id {id}: {line:?}");
        }
    }

    #[test]
    fn newline_appended_once() {
        let m = meta(Severity::Warning, 1);
        assert!(record(&m, format_args!("a\n")).ends_with("] a\n"));
        assert!(record(&m, format_args!("a")).ends_with("] a\n"));
    }

    #[test]
    fn trailer_goes_after_message() {
        let m = meta(Severity::Info, 1);
        let mut buf = Vec::new();
        format_record(&mut buf, &m, format_args!("msg"), Some("stack line\n"));
        assert!(String::from_utf8(buf).unwrap().ends_with("] msg\nstack line\n"));
    }

    #[test]
    fn long_message_truncated_to_limit() {
        let m = meta(Severity::Info, 1);
        let long = "X".repeat(MAX_LOG_MESSAGE_LEN * 2);
        let line = record(&m, format_args!("{long}"));
        assert_eq!(line.len(), MAX_LOG_MESSAGE_LEN);
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn digits() {
        let mut buf = Vec::new();
        push_digits(&mut buf, 0, 2, b'0');
        push_digits(&mut buf, 5, 2, b'0');
        push_digits(&mut buf, 123, 2, b'0');
        push_digits(&mut buf, 0, 7, b' ');
        assert_eq!(buf, b"0005123      0");
    }

    #[test]
    fn pool_reuses_and_survives_panics() {
        let pool = BufferPool::new();
        {
            let mut b = pool.get();
            b.extend_from_slice(b"hello");
        }
        assert_eq!(pool.idle(), 1);
        assert!(pool.get().is_empty());

        let res = catch_unwind(AssertUnwindSafe(|| {
            let mut b = pool.get();
            b.push(b'x');
            panic!("user Display exploded");
        }));
        assert!(res.is_err());
        assert_eq!(pool.idle(), 1);

        {
            let mut big = pool.get();
            big.reserve(MAX_POOLED_CAPACITY * 2);
        }
        assert_eq!(pool.idle(), 0);
    }
}
