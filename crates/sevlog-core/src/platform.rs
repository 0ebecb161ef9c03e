//! Process and host identity used in headers and log file names.
//!
//! Values that cannot be determined fall back to `"unknownhost"` and
//! `"unknownuser"`.

use std::path::Path;

// ---------------------------------------------------------------------------
// Unix: libc lookups
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn raw_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes; gethostname NUL-terminates on
    // success when the name fits.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}

#[cfg(unix)]
fn raw_user() -> Option<String> {
    if let Some(user) = std::env::var("USER").ok().filter(|u| !u.is_empty()) {
        return Some(user);
    }
    // SAFETY: passwd is a plain C struct; all-zero is a valid value.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; 4096];
    // SAFETY: all pointers reference live, correctly sized storage for the
    // duration of the call; pw_name points into `buf` on success.
    unsafe {
        let rc = libc::getpwuid_r(libc::getuid(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result);
        if rc != 0 || result.is_null() || pwd.pw_name.is_null() {
            return None;
        }
        std::ffi::CStr::from_ptr(pwd.pw_name).to_str().ok().map(str::to_owned)
    }
}

// ---------------------------------------------------------------------------
// Non-Unix: environment fallbacks
// ---------------------------------------------------------------------------

#[cfg(not(unix))]
fn raw_hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

#[cfg(not(unix))]
fn raw_user() -> Option<String> {
    std::env::var("USERNAME").ok()
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Current process id.
#[inline]
pub fn pid() -> u64 {
    u64::from(std::process::id())
}

/// OS thread id of the caller (process id where unavailable).
#[cfg(target_os = "linux")]
pub fn thread_id() -> u64 {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::gettid() as u64 }
}

#[cfg(not(target_os = "linux"))]
pub fn thread_id() -> u64 {
    pid()
}

/// Host name truncated at the first dot.
pub fn short_hostname(host: &str) -> &str {
    host.split('.').next().unwrap_or(host)
}

/// Full host name of this machine.
pub fn hostname() -> String {
    raw_hostname().filter(|h| !h.is_empty()).unwrap_or_else(|| "unknownhost".to_string())
}

/// Login name of the user running the process, safe for file names.
pub fn user_name() -> String {
    raw_user()
        .filter(|u| !u.is_empty())
        .map(|u| u.replace(['\\', '/'], "_"))
        .unwrap_or_else(|| "unknownuser".to_string())
}

/// Base name of the running executable.
pub fn program_name() -> String {
    std::env::args_os()
        .next()
        .as_deref()
        .and_then(|arg0| Path::new(arg0).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "sevlog".to_string())
}

/// `(tid, name)` of every thread in this process, where the OS exposes it.
#[cfg(target_os = "linux")]
pub fn live_threads() -> Vec<(u64, String)> {
    let Ok(entries) = std::fs::read_dir("/proc/self/task") else {
        return Vec::new();
    };
    let mut threads: Vec<(u64, String)> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let tid: u64 = entry.file_name().to_str()?.parse().ok()?;
            let name = std::fs::read_to_string(entry.path().join("comm")).unwrap_or_default();
            Some((tid, name.trim_end().to_string()))
        })
        .collect();
    threads.sort_unstable_by_key(|(tid, _)| *tid);
    threads
}

#[cfg(not(target_os = "linux"))]
pub fn live_threads() -> Vec<(u64, String)> {
    Vec::new()
}
