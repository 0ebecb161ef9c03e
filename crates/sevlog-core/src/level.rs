//! Verbosity control: the global `V` threshold, per-file pattern overrides
//! and the call-site cache that keeps `V` checks cheap.
//!
//! # Fast path
//!
//! A `V(level)` check is two atomic loads in the common case: if the global
//! threshold already covers `level` the answer is `true`; if no pattern rules
//! are installed the answer is `false`. Only when rules exist and the global
//! threshold is too low does the check lock the controller, look the call
//! site up in the cache and, on a miss, resolve it against the rules.
//!
//! # Invalidation
//!
//! Every configuration change runs inside the controller lock: it first
//! publishes "no rules", clears the cache, installs the new rules and
//! threshold, and finally publishes the new rule count. A reader therefore
//! never combines a cached level from the old configuration with the new one.
//!
//! # Patterns
//!
//! A rule is written `pattern=N`. The `.rs` extension is optional. A pattern
//! without `/` is matched against the base name of the source file; a pattern
//! with `/` is matched against the same number of trailing path segments.
//! Within a segment `*` matches any run of characters, `?` matches one
//! character and `[...]` matches a character class (`^` or `!` negates,
//! `a-z` ranges, `\` escapes). When several rules match, the last one wins.

use std::{
    panic::Location,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
    },
};

use ahash::AHashMap;

use crate::error::{LogError, Result};

/// Verbosity threshold for `V` records.
pub type Level = i32;

// ---------------------------------------------------------------------------
// PatternRule
// ---------------------------------------------------------------------------

/// A single `pattern=level` override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternRule {
    pattern: String,
    level: Level,
    literal: bool,
    segments: usize,
}

impl PatternRule {
    /// Build a rule, validating the glob syntax.
    pub fn new(pattern: &str, level: Level) -> Result<Self> {
        let pattern = pattern.trim();
        let pattern = pattern.strip_suffix(".rs").unwrap_or(pattern);
        if pattern.is_empty() {
            return Err(LogError::Config("vmodule: empty pattern".into()));
        }
        if level < 0 {
            return Err(LogError::Config(format!("vmodule: negative level {level} for {pattern:?}")));
        }
        validate_glob(pattern)?;
        Ok(Self {
            pattern: pattern.to_string(),
            level,
            literal: !pattern.contains(['*', '?', '[', '\\']),
            segments: pattern.split('/').count(),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Whether this rule applies to a source file path.
    pub fn matches(&self, file: &str) -> bool {
        let file = file.strip_suffix(".rs").unwrap_or(file);
        let Some(target) = trailing_segments(file, self.segments) else {
            return false;
        };
        if self.literal {
            return target == self.pattern;
        }
        self.pattern.split('/').zip(target.split('/')).all(|(p, t)| glob_match_segment(p, t))
    }
}

impl std::str::FromStr for PatternRule {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self> {
        let Some((pattern, level)) = s.split_once('=') else {
            return Err(LogError::Config(format!("vmodule: expected pattern=N, got {s:?}")));
        };
        let level = level
            .trim()
            .parse::<Level>()
            .map_err(|e| LogError::Config(format!("vmodule: bad level in {s:?}: {e}")))?;
        Self::new(pattern, level)
    }
}

/// Parse a comma-separated `pattern=N` list. Empty entries are ignored.
pub fn parse_vmodule(spec: &str) -> Result<Vec<PatternRule>> {
    spec.split(',').filter(|entry| !entry.trim().is_empty()).map(str::parse::<PatternRule>).collect()
}

/// The last `n` `/`-separated segments of `path`, or `None` if it has fewer.
fn trailing_segments(path: &str, n: usize) -> Option<&str> {
    let mut seps = 0;
    for (i, b) in path.bytes().enumerate().rev() {
        if b == b'/' {
            seps += 1;
            if seps == n {
                return Some(&path[i + 1..]);
            }
        }
    }
    (seps + 1 == n).then_some(path)
}

// ---------------------------------------------------------------------------
// Glob matching
// ---------------------------------------------------------------------------

fn validate_glob(pattern: &str) -> Result<()> {
    let p: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < p.len() {
        match p[i] {
            '[' => match match_class(&p[i..], 'a') {
                Some((_, used)) => i += used,
                None => return Err(LogError::Config(format!("vmodule: bad character class in {pattern:?}"))),
            },
            '\\' if i + 1 == p.len() => {
                return Err(LogError::Config(format!("vmodule: trailing escape in {pattern:?}")));
            }
            '\\' => i += 2,
            _ => i += 1,
        }
    }
    Ok(())
}

/// Match one path segment against one pattern segment.
pub(crate) fn glob_match_segment(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0usize, 0usize);
    // Resume point after the most recent '*': (pattern index, name index).
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi + 1, ni));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ni += 1;
                    continue;
                }
                '[' => {
                    if let Some((true, used)) = match_class(&p[pi..], n[ni]) {
                        pi += used;
                        ni += 1;
                        continue;
                    }
                }
                '\\' => {
                    if p.get(pi + 1) == Some(&n[ni]) {
                        pi += 2;
                        ni += 1;
                        continue;
                    }
                }
                c => {
                    if c == n[ni] {
                        pi += 1;
                        ni += 1;
                        continue;
                    }
                }
            }
        }
        match star {
            Some((sp, sn)) => {
                star = Some((sp, sn + 1));
                pi = sp;
                ni = sn + 1;
            }
            None => return false,
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Match `c` against the class starting at `p[0] == '['`.
///
/// Returns whether it matched and how many pattern chars the class used, or
/// `None` for a malformed class.
fn match_class(p: &[char], c: char) -> Option<(bool, usize)> {
    let mut i = 1;
    let negated = matches!(p.get(i), Some('^' | '!'));
    if negated {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    loop {
        if *p.get(i)? == ']' {
            if first {
                return None;
            }
            i += 1;
            break;
        }
        first = false;
        let (lo, next) = class_char(p, i)?;
        i = next;
        let mut hi = lo;
        if p.get(i) == Some(&'-') && p.get(i + 1).is_some_and(|&c| c != ']') {
            let (h, next) = class_char(p, i + 1)?;
            hi = h;
            i = next;
        }
        if lo <= c && c <= hi {
            matched = true;
        }
    }
    Some((matched != negated, i))
}

fn class_char(p: &[char], i: usize) -> Option<(char, usize)> {
    match *p.get(i)? {
        '\\' => p.get(i + 1).map(|&c| (c, i + 2)),
        c => Some((c, i + 1)),
    }
}

// ---------------------------------------------------------------------------
// Backtrace location
// ---------------------------------------------------------------------------

/// A `file:line` location that forces a stack trace when it logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLocation {
    pub file: String,
    pub line: u32,
}

impl std::str::FromStr for TraceLocation {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || LogError::Config(format!("log_backtrace_at: expected file:N, got {s:?}"));
        let (file, line) = s.trim().rsplit_once(':').ok_or_else(bad)?;
        let line: u32 = line.parse().map_err(|_| bad())?;
        if file.is_empty() || line == 0 {
            return Err(bad());
        }
        Ok(Self { file: base_name(file).to_string(), line })
    }
}

/// Final path component of a source file.
pub(crate) fn base_name(file: &str) -> &str {
    file.rsplit(['/', '\\']).next().unwrap_or(file)
}

// ---------------------------------------------------------------------------
// Verbosity
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct VState {
    rules: Vec<PatternRule>,
    /// Resolved level per call-site key.
    cache: AHashMap<usize, Level>,
    trace_at: Option<TraceLocation>,
}

impl VState {
    fn resolve(&self, file: &str, threshold: Level) -> Level {
        self.rules.iter().rev().find(|rule| rule.matches(file)).map_or(threshold, PatternRule::level)
    }
}

/// Global threshold + pattern overrides + call-site cache.
#[derive(Debug, Default)]
pub struct Verbosity {
    threshold: AtomicI32,
    rule_count: AtomicUsize,
    trace_set: AtomicBool,
    state: Mutex<VState>,
}

impl Verbosity {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current global threshold.
    pub fn level(&self) -> Level {
        self.threshold.load(Ordering::Acquire)
    }

    /// Replace the global threshold, keeping the pattern rules.
    pub fn set_level(&self, level: Level) {
        let mut state = self.lock();
        self.publish(&mut state, level, None);
    }

    /// Parse and apply a threshold such as `"3"`.
    pub fn set_level_str(&self, value: &str) -> Result<()> {
        let level = value
            .trim()
            .parse::<Level>()
            .map_err(|e| LogError::Config(format!("v: bad level {value:?}: {e}")))?;
        self.set_level(level);
        Ok(())
    }

    /// Replace the whole rule set, keeping the global threshold.
    pub fn set_patterns(&self, rules: Vec<PatternRule>) {
        let mut state = self.lock();
        let level = self.threshold.load(Ordering::Relaxed);
        self.publish(&mut state, level, Some(rules));
    }

    /// Replace the threshold and the rule set in one step, so no reader sees
    /// one without the other.
    pub fn configure(&self, level: Level, rules: Vec<PatternRule>) {
        let mut state = self.lock();
        self.publish(&mut state, level, Some(rules));
    }

    /// Parse and apply a `pattern=N,...` list. On error nothing changes.
    pub fn set_vmodule(&self, spec: &str) -> Result<()> {
        let rules = parse_vmodule(spec)?;
        self.set_patterns(rules);
        Ok(())
    }

    /// Installed rules, in order.
    pub fn patterns(&self) -> Vec<PatternRule> {
        self.lock().rules.clone()
    }

    /// Installed rules rendered back to `pattern=N,...` form.
    pub fn vmodule(&self) -> String {
        self.lock().rules.iter().map(|r| format!("{}={}", r.pattern, r.level)).collect::<Vec<_>>().join(",")
    }

    fn publish(&self, state: &mut VState, level: Level, rules: Option<Vec<PatternRule>>) {
        self.rule_count.store(0, Ordering::Release);
        state.cache.clear();
        if let Some(rules) = rules {
            state.rules = rules;
        }
        self.threshold.store(level, Ordering::Release);
        self.rule_count.store(state.rules.len(), Ordering::Release);
    }

    /// `V(level)` for the caller's location.
    #[track_caller]
    #[inline]
    pub fn v(&self, level: Level) -> bool {
        self.check_v(level, Location::caller())
    }

    /// `V(level)` for an explicit call site.
    #[inline]
    pub fn check_v(&self, level: Level, site: &'static Location<'static>) -> bool {
        self.check_v_key(level, site as *const Location<'static> as usize, site.file())
    }

    /// `V(level)` for a caller-supplied site key and its source file.
    ///
    /// `key` must be stable and unique per call site; the file is only read
    /// on a cache miss.
    pub fn check_v_key(&self, level: Level, key: usize, file: &str) -> bool {
        if self.threshold.load(Ordering::Acquire) >= level {
            return true;
        }
        if self.rule_count.load(Ordering::Acquire) == 0 {
            return false;
        }
        let mut state = self.lock();
        let resolved = match state.cache.get(&key) {
            Some(&v) => v,
            None => {
                let v = state.resolve(file, self.threshold.load(Ordering::Relaxed));
                state.cache.insert(key, v);
                v
            }
        };
        resolved >= level
    }

    /// Number of call sites with a cached level.
    pub fn cached_sites(&self) -> usize {
        self.lock().cache.len()
    }

    /// Set (or, with an empty string, clear) the `file:line` that forces a
    /// stack trace.
    pub fn set_backtrace_at(&self, value: &str) -> Result<()> {
        let loc = if value.trim().is_empty() { None } else { Some(value.parse::<TraceLocation>()?) };
        let mut state = self.lock();
        self.trace_set.store(loc.is_some(), Ordering::Release);
        state.trace_at = loc;
        Ok(())
    }

    /// Whether a record from `file:line` must carry a stack trace.
    #[inline]
    pub fn backtrace_at(&self, file: &str, line: u32) -> bool {
        if !self.trace_set.load(Ordering::Acquire) {
            return false;
        }
        self.lock().trace_at.as_ref().is_some_and(|loc| loc.line == line && loc.file == base_name(file))
    }
}
