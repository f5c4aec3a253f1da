//! Size/age-based rotation and bounded retention for the event log.
//!
//! Rotation renames the active log to a timestamped archive and starts a
//! fresh file; retention filters old entries out of the active log. Both are
//! idempotent and safe to re-run. A short deduplication window keeps a
//! manual trigger from racing the scheduled one.

use crate::config::RotationPolicy;
use crate::events::{self, EventLog, Severity};
use chrono::Local;
use regex::Regex;
use std::fs;
use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Two triggers inside this window execute once.
const DEDUP_WINDOW: Duration = Duration::from_secs(30);

/// Accepted archive names: `events-YYYY-MM-DD-HHMMSS.log`, with an optional
/// legacy millisecond suffix `-NNN`.
fn archive_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^events-\d{4}-\d{2}-\d{2}-\d{6}(-\d{3})?\.log$").expect("static pattern")
    })
}

/// What one rotation run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    /// Active log was created fresh (no rotation possible).
    pub initialized: bool,
    /// Run fell inside the deduplication window and did nothing.
    pub skipped: bool,
    /// Archive file the active log was rotated into.
    pub rotated_to: Option<PathBuf>,
    /// Archives deleted to enforce the retention count.
    pub archives_pruned: usize,
    /// Entries removed from the active log by age.
    pub entries_cleaned: usize,
}

/// Rotation and retention engine for one event log.
pub struct LogRotator<'a> {
    log: &'a EventLog,
    archive_dir: PathBuf,
    dedup_window: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl<'a> LogRotator<'a> {
    pub fn new(log: &'a EventLog, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            log,
            archive_dir: archive_dir.into(),
            dedup_window: DEDUP_WINDOW,
            last_run: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn without_dedup(mut self) -> Self {
        self.dedup_window = Duration::ZERO;
        self
    }

    /// Run the rotation state machine.
    ///
    /// Policy is passed per run so a settings change applies immediately.
    /// Only filesystem errors on the active log surface to the caller;
    /// everything else degrades with a logged warning.
    pub fn rotate(&self, policy: &RotationPolicy, force: bool) -> std::io::Result<RotationReport> {
        let mut report = RotationReport::default();

        {
            let mut last = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(at) = *last {
                if at.elapsed() < self.dedup_window {
                    debug!("Rotation skipped, deduplication window active");
                    report.skipped = true;
                    return Ok(report);
                }
            }
            *last = Some(Instant::now());
        }

        let _guard = self.log.writer_lock();
        let active = self.log.path();

        if !active.exists() {
            if let Some(parent) = active.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(active, format!("{}\n", events::init_marker()))?;
            info!(path = %active.display(), "Event log created");
            report.initialized = true;
            return Ok(report);
        }

        let size = fs::metadata(active)?.len();
        let should_rotate = (force && size > 0) || size > policy.max_size_bytes;

        if should_rotate {
            report.rotated_to = Some(self.archive_active(active)?);
            report.archives_pruned = self.prune_archives(policy.max_archive_count);
        }

        report.entries_cleaned = self.clean_retention(active, policy.max_retention_days)?;

        if report.rotated_to.is_some() || report.entries_cleaned > 0 {
            let note = match (&report.rotated_to, report.entries_cleaned) {
                (Some(archive), 0) => format!(
                    "log rotated to {}",
                    archive.file_name().unwrap_or_default().to_string_lossy()
                ),
                (Some(archive), n) => format!(
                    "log rotated to {}, {} aged entries removed",
                    archive.file_name().unwrap_or_default().to_string_lossy(),
                    n
                ),
                (None, n) => format!("retention cleanup removed {} aged entries", n),
            };
            self.log
                .append_locked("ipgate", "", Severity::Info, &note)?;
        }

        Ok(report)
    }

    /// Move the active log aside and start a fresh one.
    fn archive_active(&self, active: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.archive_dir)?;

        let now = Local::now();
        let mut dest = self
            .archive_dir
            .join(format!("events-{}.log", now.format("%Y-%m-%d-%H%M%S")));
        if dest.exists() {
            // Same-second collision: fall back to the millisecond variant.
            dest = self
                .archive_dir
                .join(format!("events-{}.log", now.format("%Y-%m-%d-%H%M%S-%3f")));
        }

        match fs::rename(active, &dest) {
            Ok(()) => {}
            Err(e) => {
                // Cross-device rename: copy, then truncate in place. A
                // failed copy leaves the active log untouched.
                debug!(error = %e, "Rename failed, falling back to copy+truncate");
                fs::copy(active, &dest)?;
                fs::write(active, "")?;
            }
        }

        fs::write(active, format!("{}\n", events::init_marker()))?;
        info!(archive = %dest.display(), "Event log rotated");
        Ok(dest)
    }

    /// Delete archives beyond the configured count, oldest first.
    fn prune_archives(&self, max_archive_count: usize) -> usize {
        let archives = match self.list_archives() {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "Archive listing failed, skipping prune");
                return 0;
            }
        };

        let mut pruned = 0;
        for stale in archives.iter().skip(max_archive_count) {
            match fs::remove_file(stale) {
                Ok(()) => pruned += 1,
                Err(e) => warn!(archive = %stale.display(), error = %e, "Archive delete failed"),
            }
        }
        pruned
    }

    /// Drop active-log entries older than the retention cutoff. Entries
    /// without a parsable timestamp are kept.
    fn clean_retention(&self, active: &Path, max_retention_days: u32) -> std::io::Result<usize> {
        let content = fs::read_to_string(active)?;
        let entries = events::parse_entries(&content);
        let cutoff = Local::now().naive_local() - chrono::Duration::days(max_retention_days as i64);

        let (kept, dropped): (Vec<_>, Vec<_>) = entries
            .iter()
            .partition(|e| e.timestamp.map(|ts| ts >= cutoff).unwrap_or(true));

        if dropped.is_empty() {
            return Ok(0);
        }

        let mut rebuilt: String = kept.iter().map(|e| e.raw.as_str()).collect();
        if !rebuilt.is_empty() && !rebuilt.ends_with('\n') {
            rebuilt.push('\n');
        }
        fs::write(active, rebuilt)?;

        debug!(removed = dropped.len(), "Retention cleanup");
        Ok(dropped.len())
    }

    /// Archives sorted by modification time, newest first.
    pub fn list_archives(&self) -> std::io::Result<Vec<PathBuf>> {
        if !self.archive_dir.exists() {
            return Ok(Vec::new());
        }

        let mut archives: Vec<PathBuf> = fs::read_dir(&self.archive_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| archive_pattern().is_match(n))
                    .unwrap_or(false)
            })
            .collect();

        archives.sort_by_key(|p| {
            std::cmp::Reverse(
                fs::metadata(p)
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            )
        });

        Ok(archives)
    }

    fn archive_path(&self, name: &str) -> std::io::Result<PathBuf> {
        if !archive_pattern().is_match(name) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("not an archive name: {}", name),
            ));
        }
        let path = self.archive_dir.join(name);
        if !path.exists() {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("no such archive: {}", name),
            ));
        }
        Ok(path)
    }

    /// Delete one archive by name.
    pub fn delete_archive(&self, name: &str) -> std::io::Result<()> {
        let path = self.archive_path(name)?;
        fs::remove_file(&path)?;
        info!(archive = %path.display(), "Archive deleted");
        Ok(())
    }

    /// Prepend an archive's entries back into the active log. The archive
    /// file itself is left in place.
    pub fn restore_archive(&self, name: &str) -> std::io::Result<()> {
        let path = self.archive_path(name)?;
        let _guard = self.log.writer_lock();

        let archived = fs::read_to_string(&path)?;
        let active = match fs::read_to_string(self.log.path()) {
            Ok(current) => current,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };

        let mut restored = archived;
        if !restored.is_empty() && !restored.ends_with('\n') {
            restored.push('\n');
        }
        restored.push_str(&active);
        fs::write(self.log.path(), restored)?;

        info!(archive = %path.display(), "Archive restored into active log");
        Ok(())
    }
}
