//! Worker invocation boundary.
//!
//! The core never interprets the worker's domain logic; it only needs a
//! handle exposing "is it still running", the raw output streams, and a way
//! to terminate it. The worker is either a containerized extraction image
//! (the production path) or an arbitrary command (used by tests and for
//! supervising non-containerized workers).

use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// Output format requested from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Json,
    Csv,
    Txt,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Txt => "txt",
        }
    }

    pub fn extension(self) -> &'static str {
        self.as_str()
    }
}

/// How the worker process is launched.
#[derive(Debug, Clone)]
pub enum Invocation {
    /// Inside an isolated container, identified by a unique instance name so
    /// teardown can remove it even if the process handle is lost.
    Container { image: String, name: String },
    /// A direct command; extraction parameters are passed via environment.
    Command { program: String, args: Vec<String> },
}

/// Everything needed to launch one extraction worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub url: String,
    pub instructions: String,
    /// Output filename, relative to the shared directory.
    pub output_file: String,
    pub format: OutputFormat,
    pub api_key: Option<String>,
    /// Host-side shared directory mounted into (or used by) the worker.
    pub shared_dir: PathBuf,
    /// Where the shared directory appears from the worker's point of view.
    pub shared_mount: String,
    pub invocation: Invocation,
}

impl WorkerSpec {
    fn extraction_env(&self) -> Vec<(String, String)> {
        vec![
            ("HEADLESS_MODE".into(), "true".into()),
            ("EXTRACTION_URL".into(), self.url.clone()),
            ("EXTRACTION_INSTRUCTIONS".into(), self.instructions.clone()),
            (
                "EXTRACTION_OUTPUT".into(),
                format!("{}/{}", self.shared_mount, self.output_file),
            ),
            ("EXTRACTION_FORMAT".into(), self.format.as_str().into()),
        ]
    }

    /// Resolve the program and argument list to spawn.
    pub fn command_line(&self) -> (String, Vec<String>) {
        match &self.invocation {
            Invocation::Container { image, name } => {
                let mut args = vec![
                    "run".to_string(),
                    "--rm".to_string(),
                    "--name".to_string(),
                    name.clone(),
                ];
                for (key, value) in self.extraction_env() {
                    args.push("-e".to_string());
                    args.push(format!("{key}={value}"));
                }
                if let Some(key) = &self.api_key {
                    args.push("-e".to_string());
                    args.push(format!("ANTHROPIC_API_KEY={key}"));
                }
                args.push("-v".to_string());
                args.push(format!(
                    "{}:{}",
                    self.shared_dir.display(),
                    self.shared_mount
                ));
                args.push(image.clone());
                ("docker".to_string(), args)
            }
            Invocation::Command { program, args } => (program.clone(), args.clone()),
        }
    }

    /// Loggable command line with credentials masked.
    pub fn masked_command_line(&self) -> String {
        let (program, args) = self.command_line();
        let mut parts = vec![program];
        for arg in args {
            if arg.starts_with("ANTHROPIC_API_KEY=") {
                parts.push("ANTHROPIC_API_KEY=********".to_string());
            } else {
                parts.push(arg);
            }
        }
        parts.join(" ")
    }

    /// Spawn the worker in its own process group with both output streams
    /// piped for diagnostic relay.
    pub fn spawn(&self) -> Result<WorkerHandle, WorkerError> {
        let (program, args) = self.command_line();
        tracing::info!(command = %self.masked_command_line(), "spawning extraction worker");

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Invocation::Command { .. } = self.invocation {
            cmd.envs(self.extraction_env());
            if let Some(key) = &self.api_key {
                cmd.env("ANTHROPIC_API_KEY", key);
            }
        }

        let mut child = cmd.spawn().map_err(|e| WorkerError::Spawn {
            program: program.clone(),
            source: e,
        })?;
        let pid = child.id().unwrap_or(0);
        tracing::info!(pid, "worker started");

        let container_name = match &self.invocation {
            Invocation::Container { name, .. } => Some(name.clone()),
            Invocation::Command { .. } => None,
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        Ok(WorkerHandle {
            child,
            pid,
            container_name,
            stdout,
            stderr,
        })
    }
}

/// A running (or finished) worker process.
pub struct WorkerHandle {
    child: Child,
    pid: u32,
    container_name: Option<String>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl WorkerHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn container_name(&self) -> Option<&str> {
        self.container_name.as_deref()
    }

    /// Take the raw output streams for line-by-line relay. Each can be taken
    /// once.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    /// Request graceful termination of the whole process group, escalating
    /// to SIGKILL after the grace period. Safe to call when already exited.
    pub async fn shutdown(&mut self, grace: std::time::Duration) {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(?status, "worker already exited, no termination needed");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "worker status check failed during shutdown");
            }
        }

        let pgid = Pid::from_raw(self.pid as i32);
        if let Err(e) = killpg(pgid, Signal::SIGTERM) {
            tracing::debug!(error = %e, "SIGTERM to worker group failed");
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(?status, "worker terminated gracefully");
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "wait after SIGTERM failed");
            }
            Err(_) => {
                tracing::warn!(grace_secs = grace.as_secs(), "grace period expired, killing worker group");
            }
        }
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            tracing::debug!(error = %e, "SIGKILL to worker group failed");
        }
        let _ = self.child.wait().await;
    }

    /// Force-remove the isolation container, if one was used. Errors are
    /// logged and ignored; the container may already be gone via `--rm`.
    pub async fn remove_container(&self) {
        let Some(name) = &self.container_name else {
            return;
        };
        match Command::new("docker")
            .args(["rm", "-f", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) if status.success() => {
                tracing::info!(container = %name, "container removed");
            }
            Ok(status) => {
                tracing::debug!(container = %name, ?status, "container remove exited nonzero (likely already gone)");
            }
            Err(e) => {
                tracing::warn!(container = %name, error = %e, "container remove failed");
            }
        }
    }
}

/// Errors launching a worker.
#[derive(Debug)]
pub enum WorkerError {
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Spawn { program, source } => {
                write!(f, "failed to spawn worker process {program}: {source}")
            }
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::Spawn { source, .. } => Some(source),
        }
    }
}
