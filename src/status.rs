//! The file-backed status mailbox shared between the worker and the host.
//!
//! The mailbox is a single-slot, last-write-wins file holding the latest
//! status line plus a `Last updated:` timestamp. Severity is a typed enum in
//! memory; the literal prefix tokens exist only at the file boundary.
//! Publishes use the atomic write pattern (temp file then rename) so a
//! polling reader never observes a torn record.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use regex::Regex;

use crate::context::ObservabilityContext;
use crate::logs::LogManager;

/// Severity of a status update, chosen by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Routine narration; the worker is making or reporting progress.
    Progress,
    /// A step finished successfully.
    Success,
    /// The worker cannot proceed without attention. Never advances the
    /// step counter.
    Problem,
}

impl Severity {
    /// Literal prefix token written to the mailbox file.
    pub fn prefix(self) -> &'static str {
        match self {
            Severity::Progress => "PROGRESS UPDATE: ",
            Severity::Success => "SUCCESSFULLY COMPLETED: ",
            Severity::Problem => "I HAVE A PROBLEM: ",
        }
    }

    /// Marker used in the live display line.
    pub fn marker(self) -> &'static str {
        match self {
            Severity::Progress => "..",
            Severity::Success => "ok",
            Severity::Problem => "!!",
        }
    }
}

/// One status update as published by the worker side.
#[derive(Debug, Clone)]
pub struct StatusRecord {
    pub message: String,
    pub severity: Severity,
    pub steps_completed: u32,
    pub total_steps: u32,
    pub elapsed: Duration,
}

impl StatusRecord {
    /// Coarse progress percentage: `min(100, floor(100 * steps / total))`.
    ///
    /// Advisory only — the step total is a rough phase count, not an exact
    /// plan.
    pub fn progress_percent(&self) -> u32 {
        let total = self.total_steps.max(1);
        (self.steps_completed * 100 / total).min(100)
    }

    /// Render the first mailbox line:
    /// `<PREFIX><message> (<NN>% complete, <SS>s elapsed)`.
    pub fn status_line(&self) -> String {
        format!(
            "{}{} ({}% complete, {}s elapsed)",
            self.severity.prefix(),
            self.message,
            self.progress_percent(),
            self.elapsed.as_secs()
        )
    }
}

/// A status record as seen by the host after parsing the mailbox file.
///
/// The step counter itself does not cross the file boundary, only the
/// derived percentage, so the host-side view carries what the wire format
/// carries.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub message: String,
    pub severity: Severity,
    pub percent: Option<u32>,
    pub elapsed_secs: Option<u64>,
    pub written_at: Option<NaiveDateTime>,
}

/// Parse the two-line mailbox format back into a snapshot.
///
/// A first line with no recognized prefix is treated as plain progress
/// narration; a missing or malformed suffix/timestamp degrades to `None`
/// fields rather than a parse failure.
pub fn parse_snapshot(raw: &str) -> Option<StatusSnapshot> {
    static SUFFIX: OnceLock<Regex> = OnceLock::new();
    let suffix =
        SUFFIX.get_or_init(|| Regex::new(r"\s*\((\d+)% complete, (\d+)s elapsed\)\s*$").unwrap());

    let mut lines = raw.lines();
    let first = lines.next()?;

    let (severity, rest) = if let Some(m) = first.strip_prefix("SUCCESSFULLY COMPLETED: ") {
        (Severity::Success, m)
    } else if let Some(m) = first.strip_prefix("I HAVE A PROBLEM: ") {
        (Severity::Problem, m)
    } else if let Some(m) = first.strip_prefix("PROGRESS UPDATE: ") {
        (Severity::Progress, m)
    } else {
        (Severity::Progress, first)
    };

    let (message, percent, elapsed_secs) = match suffix.captures(rest) {
        Some(caps) => {
            let start = caps.get(0).map_or(rest.len(), |m| m.start());
            let message = rest[..start].to_string();
            (message, caps[1].parse().ok(), caps[2].parse().ok())
        }
        None => (rest.to_string(), None, None),
    };

    let written_at = lines
        .next()
        .and_then(|l| l.strip_prefix("Last updated: "))
        .and_then(|ts| NaiveDateTime::parse_from_str(ts.trim(), "%Y-%m-%d %H:%M:%S").ok());

    Some(StatusSnapshot {
        message,
        severity,
        percent,
        elapsed_secs,
        written_at,
    })
}

/// The single-writer mailbox plus its historical log side channel.
///
/// Cloneable so the updater's ticker task can share it with the caller.
#[derive(Debug, Clone)]
pub struct StatusChannel {
    path: PathBuf,
    logs: LogManager,
    domain: Option<String>,
}

impl StatusChannel {
    pub fn new(ctx: &ObservabilityContext, logs: LogManager) -> Self {
        Self {
            path: ctx.mailbox_file(),
            logs,
            domain: ctx.domain().map(String::from),
        }
    }

    /// Publish a record, overwriting the mailbox atomically and appending the
    /// rendered line to the historical log so overwritten records are not
    /// lost.
    ///
    /// Publishing never fails the caller: a write error degrades to a
    /// fallback diagnostic record.
    pub fn publish(&self, record: &StatusRecord) {
        let line = record.status_line();
        if let Err(e) = self.write_mailbox(&line) {
            tracing::warn!(path = %self.path.display(), error = %e, "mailbox write failed");
            self.logs
                .write_fallback(&format!("mailbox write failed ({e}): {line}"));
        }
        self.logs
            .append("extraction_log", &line, self.domain.as_deref());
    }

    fn write_mailbox(&self, line: &str) -> std::io::Result<()> {
        let body = format!(
            "{line}\nLast updated: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        let dir = self
            .path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."));
        std::fs::create_dir_all(dir)?;
        // Unique per write: the ticker and the caller may publish concurrently.
        static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let tmp = dir.join(format!(".worker_status.tmp.{}.{seq}", std::process::id()));
        std::fs::write(&tmp, body.as_bytes())?;
        std::fs::rename(&tmp, &self.path)
    }

    /// Raw mailbox contents, or `None` if the file does not exist yet.
    /// Read errors are transient: logged and treated as absent.
    pub fn read_raw(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Some(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "mailbox read failed");
                None
            }
        }
    }

    /// Non-blocking read of the latest record; `None` when absent.
    pub fn read(&self) -> Option<StatusSnapshot> {
        self.read_raw().as_deref().and_then(parse_snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_channel() -> (tempfile::TempDir, ObservabilityContext, StatusChannel) {
        let dir = tempdir().unwrap();
        let ctx = ObservabilityContext::new(dir.path().join("shared"), Some("example_com".into()));
        ctx.init().unwrap();
        let logs = LogManager::new(&ctx, Duration::from_secs(86400));
        let channel = StatusChannel::new(&ctx, logs);
        (dir, ctx, channel)
    }

    fn record(message: &str, severity: Severity, steps: u32) -> StatusRecord {
        StatusRecord {
            message: message.to_string(),
            severity,
            steps_completed: steps,
            total_steps: 5,
            elapsed: Duration::from_secs(42),
        }
    }

    #[test]
    fn test_progress_percent_floors_and_caps() {
        assert_eq!(record("m", Severity::Progress, 0).progress_percent(), 0);
        assert_eq!(record("m", Severity::Progress, 2).progress_percent(), 40);
        assert_eq!(record("m", Severity::Progress, 7).progress_percent(), 100);

        let uneven = StatusRecord {
            message: "m".into(),
            severity: Severity::Progress,
            steps_completed: 1,
            total_steps: 3,
            elapsed: Duration::ZERO,
        };
        assert_eq!(uneven.progress_percent(), 33);
    }

    #[test]
    fn test_status_line_format() {
        let rec = record("Navigating to site", Severity::Success, 2);
        assert_eq!(
            rec.status_line(),
            "SUCCESSFULLY COMPLETED: Navigating to site (40% complete, 42s elapsed)"
        );
    }

    #[test]
    fn test_read_absent_mailbox() {
        let (_dir, _ctx, channel) = test_channel();
        assert!(channel.read().is_none());
        assert!(channel.read_raw().is_none());
    }

    #[test]
    fn test_publish_then_read_round_trip() {
        let (_dir, _ctx, channel) = test_channel();
        channel.publish(&record("Extracting data", Severity::Problem, 3));

        let snap = channel.read().unwrap();
        assert_eq!(snap.message, "Extracting data");
        assert_eq!(snap.severity, Severity::Problem);
        assert_eq!(snap.percent, Some(60));
        assert_eq!(snap.elapsed_secs, Some(42));
        assert!(snap.written_at.is_some());
    }

    #[test]
    fn test_publish_overwrites_but_log_retains_history() {
        let (_dir, ctx, channel) = test_channel();
        channel.publish(&record("first", Severity::Progress, 0));
        channel.publish(&record("second", Severity::Success, 1));

        assert_eq!(channel.read().unwrap().message, "second");

        let log = std::fs::read_to_string(
            ctx.logs_dir().join("example_com").join("extraction_log.log"),
        )
        .unwrap();
        assert!(log.contains("first"));
        assert!(log.contains("second"));
    }

    #[test]
    fn test_publish_leaves_no_temp_file() {
        let (_dir, ctx, channel) = test_channel();
        channel.publish(&record("msg", Severity::Progress, 0));

        let leftovers: Vec<_> = std::fs::read_dir(ctx.root())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(".worker_status.tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files should be renamed away");
        assert!(ctx.mailbox_file().exists());
    }

    #[test]
    fn test_parse_plain_narration_without_prefix() {
        let snap = parse_snapshot("Initializing extraction process...\nLast updated: junk").unwrap();
        assert_eq!(snap.severity, Severity::Progress);
        assert_eq!(snap.message, "Initializing extraction process...");
        assert_eq!(snap.percent, None);
        assert_eq!(snap.written_at, None);
    }

    #[test]
    fn test_parse_problem_prefix() {
        let snap =
            parse_snapshot("I HAVE A PROBLEM: rate limited (40% complete, 10s elapsed)").unwrap();
        assert_eq!(snap.severity, Severity::Problem);
        assert_eq!(snap.message, "rate limited");
        assert_eq!(snap.percent, Some(40));
        assert_eq!(snap.elapsed_secs, Some(10));
    }

    #[test]
    fn test_parse_timestamp_line() {
        let snap = parse_snapshot(
            "PROGRESS UPDATE: x (0% complete, 1s elapsed)\nLast updated: 2026-08-30 10:15:00",
        )
        .unwrap();
        let ts = snap.written_at.unwrap();
        assert_eq!(ts.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-08-30 10:15:00");
    }
}
