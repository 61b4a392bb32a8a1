//! Append-only historical logs plus periodic archival of the live status
//! files into dated snapshots.
//!
//! Log writes are observability, not control flow: every operation here is
//! best-effort. Failures are reported through `tracing`, mirrored to a
//! fallback diagnostic file when possible, and swallowed so that logging can
//! never crash the job it is describing.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Local;

use crate::context::ObservabilityContext;

/// Manages historical log files and the dated archive tree.
///
/// Cheap to clone; clones share the archive throttle so concurrent sweeps
/// do not double-archive.
#[derive(Debug, Clone)]
pub struct LogManager {
    logs_dir: PathBuf,
    archive_dir: PathBuf,
    fallback_file: PathBuf,
    /// Live single-slot files archived alongside the historical logs.
    snapshot_files: Vec<PathBuf>,
    archive_interval: Duration,
    last_archive: Arc<Mutex<Instant>>,
}

impl LogManager {
    /// Create a log manager for the given context.
    ///
    /// `archive_interval` throttles unforced archive sweeps; the throttle
    /// starts armed, so the first unforced sweep after construction is a
    /// no-op until the interval has passed.
    pub fn new(ctx: &ObservabilityContext, archive_interval: Duration) -> Self {
        Self {
            logs_dir: ctx.logs_dir(),
            archive_dir: ctx.archive_dir(),
            fallback_file: ctx.fallback_file(),
            snapshot_files: vec![ctx.mailbox_file(), ctx.monitor_file()],
            archive_interval,
            last_archive: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Path for a named log, optionally under a domain partition.
    pub fn log_path(&self, log_name: &str, domain: Option<&str>) -> PathBuf {
        match domain {
            Some(d) => self.logs_dir.join(d).join(format!("{log_name}.log")),
            None => self.logs_dir.join(format!("{log_name}.log")),
        }
    }

    /// Append a timestamped line to the named log, creating the partition
    /// directory on demand. Never fails the caller.
    pub fn append(&self, log_name: &str, content: &str, domain: Option<&str>) {
        let path = self.log_path(log_name, domain);
        if let Err(e) = self.try_append(&path, content) {
            tracing::warn!(path = %path.display(), error = %e, "log append failed");
            self.write_fallback(&format!("log append to {} failed: {e}", path.display()));
        }
    }

    fn try_append(&self, path: &Path, content: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(file, "[{timestamp}] {content}")
    }

    /// Best-effort diagnostic record for when the primary paths are
    /// unwritable. Intentionally does not propagate its own errors.
    pub fn write_fallback(&self, content: &str) {
        let line = format!("[{}] {content}\n", Local::now().format("%Y-%m-%d %H:%M:%S"));
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.fallback_file)
            .and_then(|mut f| f.write_all(line.as_bytes()));
    }

    /// Copy the live status files and historical logs into a dated archive
    /// directory. Sources are retained; archive entries are write-once
    /// history.
    ///
    /// Unforced calls are throttled to once per `archive_interval`. Returns
    /// the number of files copied; errors on individual files are logged and
    /// skipped.
    pub fn archive(&self, force: bool) -> usize {
        {
            let mut last = match self.last_archive.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !force && last.elapsed() < self.archive_interval {
                return 0;
            }
            *last = Instant::now();
        }

        let now = Local::now();
        let date_dir = self.archive_dir.join(now.format("%Y%m%d").to_string());
        if let Err(e) = std::fs::create_dir_all(&date_dir) {
            tracing::warn!(path = %date_dir.display(), error = %e, "archive dir creation failed");
            self.write_fallback(&format!("archive dir creation failed: {e}"));
            return 0;
        }

        let stamp = now.format("%Y%m%d_%H%M%S").to_string();
        let mut copied = 0;
        for source in self.archive_sources() {
            let stem = source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unnamed".to_string());
            let ext = source
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            let dest = date_dir.join(format!("{stem}_{stamp}{ext}"));
            match std::fs::copy(&source, &dest) {
                Ok(_) => copied += 1,
                Err(e) => {
                    tracing::warn!(
                        source = %source.display(),
                        error = %e,
                        "archive copy failed"
                    );
                    self.write_fallback(&format!(
                        "archive copy of {} failed: {e}",
                        source.display()
                    ));
                }
            }
        }

        tracing::debug!(copied, dir = %date_dir.display(), "archive sweep complete");
        copied
    }

    /// Existing files eligible for archival: the live snapshot files plus
    /// every `.log` under the logs dir and its first-level partitions,
    /// excluding the archive tree itself.
    fn archive_sources(&self) -> Vec<PathBuf> {
        let mut sources: Vec<PathBuf> = self
            .snapshot_files
            .iter()
            .filter(|p| p.exists())
            .cloned()
            .collect();

        let Ok(entries) = std::fs::read_dir(&self.logs_dir) else {
            return sources;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path == self.archive_dir {
                continue;
            }
            if path.extension().is_some_and(|e| e == "log") {
                sources.push(path);
            } else if path.is_dir() {
                if let Ok(sub) = std::fs::read_dir(&path) {
                    for entry in sub.flatten() {
                        let path = entry.path();
                        if path.extension().is_some_and(|e| e == "log") {
                            sources.push(path);
                        }
                    }
                }
            }
        }
        sources
    }
}
