//! Host-side extraction monitor.
//!
//! Polls the status mailbox and the worker's raw output streams, renders a
//! live single-line progress display, detects stalls, and escalates worker
//! problems to the operator. The monitor only observes: stalls and problems
//! are warnings, and the job ends only when the worker process exits (or the
//! supervisor cancels from outside).

use std::io::Write as _;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use crate::context::ObservabilityContext;
use crate::logs::LogManager;
use crate::status::{Severity, StatusChannel, StatusSnapshot};
use crate::worker::WorkerHandle;

/// Polling and stall-detection settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// How long the mailbox may be absent after start before the worker (or
    /// its isolation layer) is presumed to have failed to initialize.
    pub bootstrap_grace: Duration,
    /// Sliding window after which unchanged mailbox content counts as a
    /// stall.
    pub inactivity_window: Duration,
    /// Render the live display to stdout. Off in tests.
    pub live_display: bool,
}

/// What happens when the worker reports a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationMode {
    /// Record the problem; do not block for operator input.
    LogOnly,
    /// Prompt the operator for supplementary guidance. The input is recorded
    /// for audit only — there is no channel back into a running worker.
    Prompt,
}

/// Monitor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    NotStarted,
    Polling,
    Completed,
    Stalled,
    ProblemEscalated,
    Terminated,
}

/// The two stall shapes the monitor distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallKind {
    /// No mailbox file ever appeared within the bootstrap grace period.
    Bootstrap,
    /// Mailbox content stopped changing for the inactivity window.
    Inactivity,
}

/// Tracks mailbox activity against the two stall windows.
///
/// Takes explicit observation times so the window logic is testable without
/// real delays. Each stall fires at most once per occurrence and re-arms
/// only after activity resumes.
#[derive(Debug)]
pub struct StallTracker {
    bootstrap_grace: Duration,
    inactivity_window: Duration,
    started_at: Instant,
    mailbox_seen: bool,
    bootstrap_fired: bool,
    last_content: Option<String>,
    last_change_at: Instant,
    inactivity_fired: bool,
}

impl StallTracker {
    pub fn new(now: Instant, bootstrap_grace: Duration, inactivity_window: Duration) -> Self {
        Self {
            bootstrap_grace,
            inactivity_window,
            started_at: now,
            mailbox_seen: false,
            bootstrap_fired: false,
            last_content: None,
            last_change_at: now,
            inactivity_fired: false,
        }
    }

    /// Feed one poll observation; returns a stall warning if one fires now.
    pub fn observe(&mut self, now: Instant, content: Option<&str>) -> Option<StallKind> {
        match content {
            Some(raw) => {
                self.mailbox_seen = true;
                if self.last_content.as_deref() != Some(raw) {
                    self.last_content = Some(raw.to_string());
                    self.last_change_at = now;
                    self.inactivity_fired = false;
                    None
                } else if !self.inactivity_fired
                    && now.duration_since(self.last_change_at) >= self.inactivity_window
                {
                    self.inactivity_fired = true;
                    Some(StallKind::Inactivity)
                } else {
                    None
                }
            }
            None => {
                if !self.mailbox_seen
                    && !self.bootstrap_fired
                    && now.duration_since(self.started_at) >= self.bootstrap_grace
                {
                    self.bootstrap_fired = true;
                    Some(StallKind::Bootstrap)
                } else {
                    None
                }
            }
        }
    }

    /// Whether any mailbox content has ever been observed.
    pub fn mailbox_seen(&self) -> bool {
        self.mailbox_seen
    }
}

/// Render the display line for a parsed status record.
pub(crate) fn render_status_line(elapsed_secs: u64, snap: &StatusSnapshot) -> String {
    format!(
        "[{elapsed_secs}s] {} {}",
        snap.severity.marker(),
        snap.message
    )
}

/// Render the synthetic waiting line shown before the mailbox exists.
pub(crate) fn render_waiting_line(elapsed_secs: u64, spinner: char, dots: usize) -> String {
    format!(
        "[{elapsed_secs}s] {spinner} Extraction in progress{}",
        ".".repeat(dots)
    )
}

/// Summary of one monitoring run.
#[derive(Debug)]
pub struct MonitorSummary {
    pub exit_status: Option<std::process::ExitStatus>,
    pub stall_warnings: Vec<StallKind>,
    pub problems_seen: u32,
    /// Delay until the first status record appeared, if one ever did.
    pub first_status_after: Option<Duration>,
    pub last_snapshot: Option<StatusSnapshot>,
}

/// Polls one job's status channel and worker process.
pub struct ExtractionMonitor {
    channel: StatusChannel,
    logs: LogManager,
    domain: Option<String>,
    monitor_file: PathBuf,
    config: MonitorConfig,
    escalation: EscalationMode,
    state: MonitorState,
}

impl ExtractionMonitor {
    pub fn new(
        ctx: &ObservabilityContext,
        channel: StatusChannel,
        logs: LogManager,
        config: MonitorConfig,
        escalation: EscalationMode,
    ) -> Self {
        Self {
            channel,
            logs,
            domain: ctx.domain().map(String::from),
            monitor_file: ctx.monitor_file(),
            config,
            escalation,
            state: MonitorState::NotStarted,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Poll until the worker process exits.
    ///
    /// Never aborts the job it observes: poll errors degrade to "absent"
    /// reads, stalls and problems are surfaced as warnings, and the loop
    /// ends only on worker exit (or when the caller drops this future, e.g.
    /// on timeout or cancellation).
    pub async fn run(&mut self, handle: &mut WorkerHandle) -> MonitorSummary {
        self.state = MonitorState::Polling;
        let started = Instant::now();
        let mut tracker = StallTracker::new(
            started,
            self.config.bootstrap_grace,
            self.config.inactivity_window,
        );
        let mut summary = MonitorSummary {
            exit_status: None,
            stall_warnings: Vec::new(),
            problems_seen: 0,
            first_status_after: None,
            last_snapshot: None,
        };
        let spinner = ['|', '/', '-', '\\'];
        let mut spin_idx = 0usize;
        let mut dots = 0usize;
        let mut last_problem: Option<String> = None;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let elapsed_secs = started.elapsed().as_secs();

            match handle.try_wait() {
                Ok(Some(status)) => {
                    self.state = MonitorState::Completed;
                    summary.exit_status = Some(status);
                    self.display(&format!("[{elapsed_secs}s] Extraction process completed"), true);
                    self.logs.append(
                        "extraction_events",
                        &format!("worker exited with {status} after {elapsed_secs}s"),
                        self.domain.as_deref(),
                    );
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    // Transient: keep observing.
                    tracing::warn!(error = %e, "worker status check failed");
                }
            }

            let raw = self.channel.read_raw();
            if raw.is_some() && summary.first_status_after.is_none() {
                summary.first_status_after = Some(started.elapsed());
                self.logs.append(
                    "extraction_events",
                    "first worker status observed, job is running",
                    self.domain.as_deref(),
                );
            }

            if let Some(stall) = tracker.observe(Instant::now(), raw.as_deref()) {
                self.state = MonitorState::Stalled;
                summary.stall_warnings.push(stall);
                self.warn_stall(stall, elapsed_secs);
            }

            match raw.as_deref().and_then(crate::status::parse_snapshot) {
                Some(snap) => {
                    if snap.severity == Severity::Problem
                        && last_problem.as_deref() != Some(snap.message.as_str())
                    {
                        last_problem = Some(snap.message.clone());
                        summary.problems_seen += 1;
                        self.escalate_problem(&snap.message).await;
                    } else if self.state != MonitorState::Polling
                        && snap.severity != Severity::Problem
                    {
                        // Activity resumed after a stall or problem.
                        self.state = MonitorState::Polling;
                    }
                    self.display(&render_status_line(elapsed_secs, &snap), false);
                    summary.last_snapshot = Some(snap);
                }
                None => {
                    let line = render_waiting_line(elapsed_secs, spinner[spin_idx], dots);
                    spin_idx = (spin_idx + 1) % spinner.len();
                    dots = (dots + 1) % 4;
                    self.display(&line, false);
                }
            }
        }

        self.state = MonitorState::Terminated;
        summary
    }

    fn warn_stall(&self, stall: StallKind, elapsed_secs: u64) {
        let description = match stall {
            StallKind::Bootstrap => format!(
                "no status file after {elapsed_secs}s; the worker or its isolation layer may have failed to initialize"
            ),
            StallKind::Inactivity => format!(
                "no status change for {}s; the worker may be stuck",
                self.config.inactivity_window.as_secs()
            ),
        };
        tracing::warn!(%description, "stall detected");
        if self.config.live_display {
            eprintln!("\nWarning: {description}");
        }
        self.logs.append(
            "extraction_events",
            &format!("stall warning: {description}"),
            self.domain.as_deref(),
        );
    }

    async fn escalate_problem(&mut self, message: &str) {
        self.state = MonitorState::ProblemEscalated;
        tracing::warn!(problem = %message, "worker reported a problem");
        if self.config.live_display {
            eprintln!("\nWORKER PROBLEM: {message}");
        }
        self.logs.append(
            "extraction_events",
            &format!("worker problem escalated: {message}"),
            self.domain.as_deref(),
        );

        if self.escalation == EscalationMode::Prompt {
            eprintln!("Additional guidance for the record (blank to skip):");
            let note = tokio::task::spawn_blocking(|| {
                let mut buf = String::new();
                std::io::stdin().read_line(&mut buf).ok().map(|_| buf)
            })
            .await
            .ok()
            .flatten();
            if let Some(note) = note {
                let note = note.trim();
                if !note.is_empty() {
                    // Audit only: there is no channel to deliver this into a
                    // running worker.
                    self.logs.append(
                        "operator_notes",
                        &format!("guidance after problem \"{message}\": {note}"),
                        self.domain.as_deref(),
                    );
                }
            }
        }
    }

    /// Write the live display line in place and mirror it to the monitor
    /// status file. Both are best-effort.
    fn display(&self, line: &str, final_line: bool) {
        if self.config.live_display {
            let mut out = std::io::stdout();
            if final_line {
                let _ = writeln!(out, "\r{line:<100}");
            } else {
                let _ = write!(out, "\r{line:<100}");
            }
            let _ = out.flush();
        }
        if let Err(e) = std::fs::write(&self.monitor_file, line) {
            tracing::debug!(error = %e, "monitor status mirror write failed");
        }
    }
}

/// Relay one raw worker output stream line-by-line into the diagnostic log.
pub fn spawn_stream_relay<R>(
    stream: R,
    logs: LogManager,
    domain: Option<String>,
    label: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(stream = label, line = %line, "worker output");
            logs.append("worker_output", &format!("[{label}] {line}"), domain.as_deref());
        }
    })
}
