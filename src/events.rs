//! Event-log line format, severity taxonomy, and the append-only writer.
//!
//! Line format, consumed and produced across the crate:
//!
//! ```text
//! [YYYY-MM-DD HH:MM:SS][<ip-or-tag>][<username-or-empty>][<LEVEL>] <message>
//! ```
//!
//! Corrupted files may carry entries back-to-back without newlines, so the
//! reader splits on lookahead for the timestamp pattern, never on newlines.

use chrono::{Local, NaiveDateTime};
use regex::Regex;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Window for counting failed logins from one source.
const LOGIN_WINDOW: Duration = Duration::from_secs(600);

fn timestamp_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\]").expect("static pattern")
    })
}

/// Event severity, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Notice,
    Warning,
    Error,
    Fatal,
    Deprecated,
    Scan,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Notice => "NOTICE",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
            Severity::Deprecated => "DEPRECATED",
            Severity::Scan => "SCAN",
        }
    }

    /// Escalation band for repeated failed logins from one IP inside a
    /// ten-minute window.
    pub fn for_failed_logins(count: usize) -> Severity {
        match count {
            0..=2 => Severity::Notice,
            3..=5 => Severity::Warning,
            _ => Severity::Scan,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Ok(Severity::Info),
            "NOTICE" => Ok(Severity::Notice),
            "WARNING" => Ok(Severity::Warning),
            "ERROR" => Ok(Severity::Error),
            "FATAL" => Ok(Severity::Fatal),
            "DEPRECATED" => Ok(Severity::Deprecated),
            "SCAN" => Ok(Severity::Scan),
            _ => Err(()),
        }
    }
}

/// One parsed event-log entry.
///
/// `timestamp` is `None` for leading garbage or entries whose header cannot
/// be parsed; those entries survive retention cleanup untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEntry {
    pub timestamp: Option<NaiveDateTime>,
    pub tag: String,
    pub username: String,
    pub level: Option<Severity>,
    pub message: String,
    /// The entry's exact original text, rewritten verbatim on cleanup.
    pub raw: String,
}

/// Render one log line (without trailing newline).
pub fn format_line(
    timestamp: NaiveDateTime,
    tag: &str,
    username: &str,
    level: Severity,
    message: &str,
) -> String {
    format!(
        "[{}][{}][{}][{}] {}",
        timestamp.format(TIMESTAMP_FORMAT),
        tag,
        username,
        level,
        message
    )
}

/// Split raw log content into entries on timestamp lookahead.
pub fn parse_entries(content: &str) -> Vec<EventEntry> {
    let mut entries = Vec::new();
    let starts: Vec<usize> = timestamp_pattern()
        .find_iter(content)
        .map(|m| m.start())
        .collect();

    if starts.is_empty() {
        if !content.trim().is_empty() {
            entries.push(unparsed_entry(content));
        }
        return entries;
    }

    if starts[0] > 0 {
        let head = &content[..starts[0]];
        if !head.trim().is_empty() {
            entries.push(unparsed_entry(head));
        }
    }

    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(content.len());
        entries.push(parse_entry(&content[start..end]));
    }

    entries
}

fn unparsed_entry(raw: &str) -> EventEntry {
    EventEntry {
        timestamp: None,
        tag: String::new(),
        username: String::new(),
        level: None,
        message: raw.trim_end_matches('\n').to_string(),
        raw: raw.to_string(),
    }
}

/// Parse a single entry known to start with a timestamp bracket.
fn parse_entry(raw: &str) -> EventEntry {
    let mut entry = unparsed_entry(raw);
    let trimmed = raw.trim_end_matches('\n');

    let Some(ts_end) = trimmed.find(']') else {
        return entry;
    };
    entry.timestamp = NaiveDateTime::parse_from_str(&trimmed[1..ts_end], TIMESTAMP_FORMAT).ok();

    // Up to three further bracketed fields: tag, username, level.
    let mut rest = &trimmed[ts_end + 1..];
    let mut fields: Vec<&str> = Vec::new();
    while fields.len() < 3 && rest.starts_with('[') {
        let Some(end) = rest.find(']') else { break };
        fields.push(&rest[1..end]);
        rest = &rest[end + 1..];
    }

    if let Some(tag) = fields.first() {
        entry.tag = (*tag).to_string();
    }
    if let Some(user) = fields.get(1) {
        entry.username = (*user).to_string();
    }
    if let Some(level) = fields.get(2) {
        entry.level = level.parse().ok();
    }
    entry.message = rest.trim_start().to_string();

    entry
}

/// Append-only event-log writer with an exclusive-write discipline.
///
/// The same lock covers appends and rotation so a rotation never races an
/// in-flight write.
pub struct EventLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the writer lock; used by the rotation engine while it swaps
    /// files underneath the writer.
    pub fn writer_lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one entry, creating the file (with its initialization marker)
    /// on first use.
    pub fn append(
        &self,
        tag: &str,
        username: &str,
        level: Severity,
        message: &str,
    ) -> std::io::Result<()> {
        let _guard = self.writer_lock();
        self.append_locked(tag, username, level, message)
    }

    /// Append while the caller already holds [`Self::writer_lock`].
    pub fn append_locked(
        &self,
        tag: &str,
        username: &str,
        level: Severity,
        message: &str,
    ) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let fresh = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if fresh {
            writeln!(file, "{}", init_marker())?;
        }
        writeln!(
            file,
            "{}",
            format_line(Local::now().naive_local(), tag, username, level, message)
        )?;
        file.flush()
    }
}

/// The first line of every fresh event log.
pub fn init_marker() -> String {
    format_line(
        Local::now().naive_local(),
        "ipgate",
        "",
        Severity::Info,
        "event log initialized",
    )
}

/// Per-IP failed-login counter over a sliding ten-minute window.
#[derive(Debug, Default)]
pub struct LoginTracker {
    failures: HashMap<IpAddr, Vec<Instant>>,
}

impl LoginTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed login and return the escalated severity for the
    /// current window.
    pub fn record_failure(&mut self, ip: IpAddr) -> Severity {
        self.record_at(ip, Instant::now())
    }

    fn record_at(&mut self, ip: IpAddr, at: Instant) -> Severity {
        let window = self.failures.entry(ip).or_default();
        window.retain(|t| at.duration_since(*t) < LOGIN_WINDOW);
        window.push(at);
        Severity::for_failed_logins(window.len())
    }

    /// Failures currently inside the window for `ip`.
    pub fn failures(&self, ip: &IpAddr) -> usize {
        self.failures.get(ip).map(|w| w.len()).unwrap_or(0)
    }
}
