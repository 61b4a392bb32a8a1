//! Job lifecycle supervision.
//!
//! Wraps worker start, the hard wall-clock budget, operator cancellation,
//! and guaranteed teardown. Every exit path — normal completion, timeout,
//! cancellation, failure — converges on a single guarded teardown that stops
//! the worker, releases its isolation container, and force-archives the
//! logs exactly once.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Local;

use crate::config::HarnessConfig;
use crate::context::ObservabilityContext;
use crate::logs::LogManager;
use crate::monitor::{
    spawn_stream_relay, EscalationMode, ExtractionMonitor, MonitorConfig, MonitorSummary,
};
use crate::results::{classify_narration, NarrationOutcome, OutcomeClass};
use crate::status::StatusChannel;
use crate::worker::{WorkerHandle, WorkerSpec};

/// Terminal and transitional states of one supervised job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Starting,
    Running,
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Starting => "starting",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one supervised job.
#[derive(Debug)]
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    pub duration: Duration,
    pub exit_code: Option<i32>,
    /// Located output artifact, when the job completed and one was found.
    pub artifact: Option<PathBuf>,
    /// Fallback classification of the worker's narration.
    pub narration: Option<NarrationOutcome>,
    pub stall_warnings: usize,
    pub problems_seen: u32,
    pub error: Option<String>,
}

impl JobReport {
    /// A job counts as a success only if the worker exited cleanly and the
    /// declared artifact was actually found.
    pub fn success(&self) -> bool {
        self.status == JobStatus::Completed && self.artifact.is_some()
    }
}

/// Once-only teardown shared by every exit path.
///
/// The guard makes teardown reentrant-safe: concurrent or repeated exit
/// paths (timeout racing completion, cancel during teardown) run the body
/// at most once.
pub struct Teardown {
    ran: AtomicBool,
    logs: LogManager,
    domain: Option<String>,
    grace: Duration,
}

impl Teardown {
    pub fn new(logs: LogManager, domain: Option<String>, grace: Duration) -> Self {
        Self {
            ran: AtomicBool::new(false),
            logs,
            domain,
            grace,
        }
    }

    /// Stop the worker, release its container, and force-archive the logs.
    /// Returns false (and does nothing) if teardown already ran.
    pub async fn run(&self, handle: &mut WorkerHandle, reason: &str) -> bool {
        if self.ran.swap(true, Ordering::SeqCst) {
            tracing::debug!(reason, "teardown already ran, skipping");
            return false;
        }
        tracing::info!(reason, "tearing down job");
        handle.shutdown(self.grace).await;
        handle.remove_container().await;
        self.logs.archive(true);
        self.logs.append(
            "extraction_events",
            &format!("teardown complete ({reason})"),
            self.domain.as_deref(),
        );
        true
    }
}

/// Locate the declared output artifact via a small set of fallback
/// locations: the exact path, the shared root, first-level subdirectories,
/// then a recursive filename match.
pub fn locate_artifact(shared_root: &Path, declared: &Path) -> Option<PathBuf> {
    if declared.is_file() {
        return Some(declared.to_path_buf());
    }

    let relative = shared_root.join(declared);
    if relative.is_file() {
        return Some(relative);
    }

    let name = declared.file_name()?;
    if let Ok(entries) = std::fs::read_dir(shared_root) {
        for entry in entries.flatten() {
            let candidate = entry.path().join(name);
            if entry.path().is_dir() && candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    let pattern = format!("{}/**/{}", shared_root.display(), name.to_string_lossy());
    glob::glob(&pattern)
        .ok()?
        .flatten()
        .find(|p| p.is_file())
}

/// Supervises one worker execution end to end.
pub struct LifecycleSupervisor {
    ctx: ObservabilityContext,
    logs: LogManager,
    channel: StatusChannel,
    config: HarnessConfig,
    escalation: EscalationMode,
}

impl LifecycleSupervisor {
    pub fn new(ctx: ObservabilityContext, config: HarnessConfig, escalation: EscalationMode) -> Self {
        let logs = LogManager::new(&ctx, config.archive_interval());
        let channel = StatusChannel::new(&ctx, logs.clone());
        Self {
            ctx,
            logs,
            channel,
            config,
            escalation,
        }
    }

    /// Run one job: spawn the worker, monitor it under the hard wall-clock
    /// budget with cancellation armed, then tear down and report.
    ///
    /// Never returns early without teardown; orchestration failures are
    /// reported as `Failed` rather than propagated.
    pub async fn supervise(&self, spec: &WorkerSpec) -> JobReport {
        let domain = self.ctx.domain().map(String::from);
        let job_id = format!(
            "{}-{}",
            domain.as_deref().unwrap_or("job"),
            Local::now().format("%Y%m%d_%H%M%S")
        );
        let started = Instant::now();
        self.logs.append(
            "extraction_events",
            &format!("job {job_id} {}: {}", JobStatus::Starting, spec.url),
            domain.as_deref(),
        );

        let mut handle = match spec.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "worker spawn failed");
                self.logs.append(
                    "extraction_events",
                    &format!("job {job_id} failed to start: {e}"),
                    domain.as_deref(),
                );
                self.logs.archive(true);
                return JobReport {
                    job_id,
                    status: JobStatus::Failed,
                    duration: started.elapsed(),
                    exit_code: None,
                    artifact: None,
                    narration: None,
                    stall_warnings: 0,
                    problems_seen: 0,
                    error: Some(e.to_string()),
                };
            }
        };

        let relays: Vec<_> = [
            handle
                .take_stdout()
                .map(|s| spawn_stream_relay(s, self.logs.clone(), domain.clone(), "stdout")),
            handle
                .take_stderr()
                .map(|s| spawn_stream_relay(s, self.logs.clone(), domain.clone(), "stderr")),
        ]
        .into_iter()
        .flatten()
        .collect();

        // Coarse host-side view: the job is running once the worker process
        // is live under monitoring. The finer "first status record observed"
        // transition is logged by the monitor itself.
        self.logs.append(
            "extraction_events",
            &format!("job {job_id} {}: worker pid {}", JobStatus::Running, handle.pid()),
            domain.as_deref(),
        );

        let mut monitor = ExtractionMonitor::new(
            &self.ctx,
            self.channel.clone(),
            self.logs.clone(),
            MonitorConfig {
                poll_interval: self.config.poll_interval(),
                bootstrap_grace: self.config.bootstrap_grace(),
                inactivity_window: self.config.inactivity_window(),
                live_display: self.escalation == EscalationMode::Prompt,
            },
            self.escalation,
        );

        let teardown = Teardown::new(
            self.logs.clone(),
            domain.clone(),
            self.config.shutdown_grace(),
        );

        let mut summary: Option<MonitorSummary> = None;
        let (status, exit_code) = tokio::select! {
            finished = monitor.run(&mut handle) => {
                let (status, code) = match finished.exit_status {
                    Some(s) if s.success() => (JobStatus::Completed, s.code()),
                    Some(s) => (JobStatus::Failed, s.code()),
                    None => (JobStatus::Failed, None),
                };
                summary = Some(finished);
                (status, code)
            }
            _ = tokio::time::sleep(self.config.hard_timeout()) => {
                tracing::warn!(
                    budget_secs = self.config.hard_timeout().as_secs(),
                    "hard execution budget exceeded"
                );
                (JobStatus::TimedOut, None)
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("operator interrupt received, cancelling job");
                (JobStatus::Cancelled, None)
            }
        };

        teardown.run(&mut handle, status.as_str()).await;

        // Give the relay tasks a moment to drain the closed pipes.
        for relay in relays {
            let _ = tokio::time::timeout(Duration::from_secs(1), relay).await;
        }

        let narration = self.classify_worker_output(spec, domain.as_deref());
        let artifact = if status == JobStatus::Completed {
            locate_artifact(self.ctx.root(), Path::new(&spec.output_file))
        } else {
            None
        };
        if status == JobStatus::Completed && artifact.is_none() {
            tracing::warn!(
                declared = %spec.output_file,
                "worker exited cleanly but the declared artifact was not found"
            );
        }

        let report = JobReport {
            job_id,
            status,
            duration: started.elapsed(),
            exit_code,
            artifact,
            narration,
            stall_warnings: summary.as_ref().map_or(0, |s| s.stall_warnings.len()),
            problems_seen: summary.as_ref().map_or(0, |s| s.problems_seen),
            error: None,
        };
        self.write_metadata(spec, &report);
        self.logs.append(
            "extraction_events",
            &format!(
                "job {} finished: {} after {}s",
                report.job_id,
                report.status,
                report.duration.as_secs()
            ),
            domain.as_deref(),
        );
        report
    }

    /// Run the fallback narration classifier over the relayed worker output.
    fn classify_worker_output(
        &self,
        spec: &WorkerSpec,
        domain: Option<&str>,
    ) -> Option<NarrationOutcome> {
        let path = self.logs.log_path("worker_output", domain);
        let text = std::fs::read_to_string(path).ok()?;
        // Narrated paths are in the worker's view of the shared directory.
        Some(classify_narration(&text, Path::new(&spec.shared_mount)))
    }

    /// Best-effort completion metadata next to the declared artifact.
    fn write_metadata(&self, spec: &WorkerSpec, report: &JobReport) {
        let metadata = serde_json::json!({
            "job_id": report.job_id,
            "url": spec.url,
            "status": report.status.as_str(),
            "duration_secs": report.duration.as_secs(),
            "exit_code": report.exit_code,
            "artifact": report.artifact.as_ref().map(|p| p.display().to_string()),
            "narration_complete": report
                .narration
                .as_ref()
                .map(|n| n.class == OutcomeClass::Complete),
            "narrated_paths": report.narration.as_ref().map(|n| n.paths.clone()),
            "stall_warnings": report.stall_warnings,
            "problems_seen": report.problems_seen,
        });
        let path = self
            .ctx
            .root()
            .join(format!("{}.metadata.json", spec.output_file));
        match serde_json::to_string_pretty(&metadata) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&path, body) {
                    tracing::warn!(path = %path.display(), error = %e, "metadata write failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "metadata serialization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{Invocation, OutputFormat};
    use tempfile::tempdir;

    fn fast_config(hard_timeout_secs: u64) -> HarnessConfig {
        let mut config = HarnessConfig::default();
        config.monitor.poll_interval_ms = 10;
        config.limits.hard_timeout_secs = hard_timeout_secs;
        config.limits.shutdown_grace_secs = 1;
        config
    }

    fn shell_spec(ctx: &ObservabilityContext, cmd: &str, output_file: &str) -> WorkerSpec {
        WorkerSpec {
            url: "https://www.example.com".into(),
            instructions: "extract the table".into(),
            output_file: output_file.into(),
            format: OutputFormat::Json,
            api_key: None,
            shared_dir: ctx.root().to_path_buf(),
            shared_mount: ctx.root().display().to_string(),
            invocation: Invocation::Command {
                program: "sh".into(),
                args: vec!["-c".into(), cmd.into()],
            },
        }
    }

    fn supervisor(dir: &Path, hard_timeout_secs: u64) -> (ObservabilityContext, LifecycleSupervisor) {
        let ctx = ObservabilityContext::new(dir.join("shared"), Some("example_com".into()));
        ctx.init().unwrap();
        let sup = LifecycleSupervisor::new(
            ctx.clone(),
            fast_config(hard_timeout_secs),
            EscalationMode::LogOnly,
        );
        (ctx, sup)
    }

    #[test]
    fn test_locate_artifact_fallback_chain() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("shared");
        std::fs::create_dir_all(root.join("example_com/deep")).unwrap();

        // Nothing yet.
        assert_eq!(locate_artifact(&root, Path::new("data.json")), None);

        // Recursive match, deepest fallback.
        std::fs::write(root.join("example_com/deep/data.json"), "x").unwrap();
        assert_eq!(
            locate_artifact(&root, Path::new("data.json")),
            Some(root.join("example_com/deep/data.json"))
        );

        // First-level subdirectory wins over recursive.
        std::fs::write(root.join("example_com/data.json"), "x").unwrap();
        assert_eq!(
            locate_artifact(&root, Path::new("data.json")),
            Some(root.join("example_com/data.json"))
        );

        // Shared-root-relative wins over subdirectories.
        std::fs::write(root.join("data.json"), "x").unwrap();
        assert_eq!(
            locate_artifact(&root, Path::new("data.json")),
            Some(root.join("data.json"))
        );

        // Exact path wins over everything.
        let exact = dir.path().join("elsewhere.json");
        std::fs::write(&exact, "x").unwrap();
        assert_eq!(locate_artifact(&root, &exact), Some(exact));
    }

    #[tokio::test]
    async fn test_teardown_runs_exactly_once() {
        let dir = tempdir().unwrap();
        let ctx = ObservabilityContext::new(dir.path().join("shared"), None);
        ctx.init().unwrap();
        let logs = LogManager::new(&ctx, Duration::from_secs(86400));
        std::fs::write(ctx.mailbox_file(), "leftover status").unwrap();

        let spec = shell_spec(&ctx, "sleep 30", "out.json");
        let mut handle = spec.spawn().unwrap();
        let teardown = Teardown::new(logs, None, Duration::from_millis(200));

        assert!(teardown.run(&mut handle, "first").await);
        assert!(!teardown.run(&mut handle, "second").await);
        assert_eq!(handle.try_wait().unwrap().map(|s| s.success()), Some(false));

        // Exactly one archive sweep ran.
        let date_dirs: Vec<_> = std::fs::read_dir(ctx.archive_dir()).unwrap().flatten().collect();
        assert_eq!(date_dirs.len(), 1);
    }

    #[tokio::test]
    async fn test_supervise_successful_job() {
        let dir = tempdir().unwrap();
        let (ctx, sup) = supervisor(dir.path(), 30);

        let cmd = r#"echo "Data saved to $EXTRACTION_OUTPUT"; printf '{}' > "$EXTRACTION_OUTPUT""#;
        let spec = shell_spec(&ctx, cmd, "example_com_data.json");
        let report = sup.supervise(&spec).await;

        assert_eq!(report.status, JobStatus::Completed);
        assert!(report.success());
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.artifact, Some(ctx.root().join("example_com_data.json")));
        let narration = report.narration.unwrap();
        assert_eq!(narration.class, OutcomeClass::Complete);
        assert!(ctx.root().join("example_com_data.json.metadata.json").exists());
    }

    #[tokio::test]
    async fn test_supervise_worker_failure() {
        let dir = tempdir().unwrap();
        let (_ctx, sup) = supervisor(dir.path(), 30);

        let spec = shell_spec(&sup.ctx, "exit 3", "out.json");
        let report = sup.supervise(&spec).await;

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.exit_code, Some(3));
        assert!(!report.success());
        assert!(report.artifact.is_none());
    }

    #[tokio::test]
    async fn test_supervise_times_out_and_retains_partial_state() {
        let dir = tempdir().unwrap();
        let (ctx, sup) = supervisor(dir.path(), 0);

        // Worker writes a status mailbox then hangs past the budget.
        let mailbox = ctx.mailbox_file();
        let cmd = format!(
            "printf 'PROGRESS UPDATE: working (20%% complete, 1s elapsed)\\nLast updated: now' > {}; sleep 30",
            mailbox.display()
        );
        let spec = shell_spec(&ctx, &cmd, "out.json");

        let started = Instant::now();
        let report = sup.supervise(&spec).await;
        assert!(started.elapsed() < Duration::from_secs(20));

        assert_eq!(report.status, JobStatus::TimedOut);
        assert!(!report.success());
        // Partial-run files stay readable for post-mortem inspection.
        let events = std::fs::read_to_string(
            sup.logs.log_path("extraction_events", Some("example_com")),
        )
        .unwrap();
        assert!(events.contains("teardown complete (timed_out)"));
        assert!(events.contains("finished: timed_out"));
    }

    #[tokio::test]
    async fn test_supervise_spawn_failure_is_failed() {
        let dir = tempdir().unwrap();
        let (ctx, sup) = supervisor(dir.path(), 30);

        let spec = WorkerSpec {
            invocation: Invocation::Command {
                program: "/nonexistent/worker-binary".into(),
                args: vec![],
            },
            ..shell_spec(&ctx, "true", "out.json")
        };
        let report = sup.supervise(&spec).await;
        assert_eq!(report.status, JobStatus::Failed);
        assert!(report.error.unwrap().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_supervise_completed_without_artifact_is_not_success() {
        let dir = tempdir().unwrap();
        let (ctx, sup) = supervisor(dir.path(), 30);

        let spec = shell_spec(&ctx, "echo done", "never_written.json");
        let report = sup.supervise(&spec).await;

        assert_eq!(report.status, JobStatus::Completed);
        assert!(report.artifact.is_none());
        assert!(!report.success());
    }
}
