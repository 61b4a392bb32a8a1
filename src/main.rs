use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use extraction_harness::config::HarnessConfig;
use extraction_harness::context::{normalize_domain, ObservabilityContext};
use extraction_harness::lifecycle::{JobStatus, LifecycleSupervisor};
use extraction_harness::monitor::EscalationMode;
use extraction_harness::worker::{Invocation, OutputFormat, WorkerSpec};

/// Supervises a headless web-extraction worker: launch it (optionally inside
/// an isolated container), watch its file-backed status mailbox, surface
/// stalls and problems, enforce a hard time budget, and tear everything down
/// on every exit path.
#[derive(Parser, Debug)]
#[command(name = "extraction-harness", version, about)]
struct Cli {
    /// URL to extract data from
    #[arg(long)]
    url: String,

    /// Free-text extraction instructions for the worker
    #[arg(long)]
    instructions: String,

    /// Output filename under the shared directory
    /// (default: <domain>_data_<YYYYMMDD>.<format>)
    #[arg(long)]
    output: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value = "json")]
    format: OutputFormat,

    /// API key (falls back to the configured environment variable)
    #[arg(long)]
    api_key: Option<String>,

    /// Shared directory exchanged with the worker
    #[arg(long, default_value = "shared")]
    shared_dir: PathBuf,

    /// Config file path
    #[arg(short, long, default_value = "extractor.toml")]
    config: PathBuf,

    /// Hard wall-clock budget in seconds (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Supervise this shell command directly instead of the extraction
    /// container
    #[arg(long)]
    worker_cmd: Option<String>,

    /// Never prompt on problem escalation; record problems to the log only
    #[arg(long)]
    no_prompt: bool,

    /// Extra logging (poll decisions, stall checks)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "info" })
        });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = match HarnessConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(secs) = cli.timeout {
        config.limits.hard_timeout_secs = secs;
    }

    let domain = normalize_domain(&cli.url);
    let output_file = cli.output.clone().unwrap_or_else(|| {
        format!(
            "{domain}_data_{}.{}",
            chrono::Local::now().format("%Y%m%d"),
            cli.format.extension()
        )
    });

    let ctx = ObservabilityContext::new(&cli.shared_dir, Some(domain.clone()));
    if let Err(e) = ctx.init() {
        eprintln!(
            "Error: cannot initialize shared directory {}: {e}",
            cli.shared_dir.display()
        );
        return ExitCode::FAILURE;
    }
    // The container mount needs an absolute host path.
    let shared_abs = std::fs::canonicalize(&cli.shared_dir)
        .unwrap_or_else(|_| cli.shared_dir.clone());

    let api_key = cli
        .api_key
        .clone()
        .or_else(|| std::env::var(&config.container.api_key_env).ok());

    let (invocation, shared_mount) = match &cli.worker_cmd {
        Some(cmd) => (
            Invocation::Command {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), cmd.clone()],
            },
            shared_abs.display().to_string(),
        ),
        None => {
            if api_key.is_none() {
                eprintln!(
                    "Error: no API key; pass --api-key or set {}",
                    config.container.api_key_env
                );
                return ExitCode::FAILURE;
            }
            (
                Invocation::Container {
                    image: config.container.image.clone(),
                    name: format!(
                        "{}-{domain}-{}",
                        config.container.name_prefix,
                        std::process::id()
                    ),
                },
                config.container.shared_mount.clone(),
            )
        }
    };

    let escalation = if cli.no_prompt || !std::io::stdin().is_terminal() {
        EscalationMode::LogOnly
    } else {
        EscalationMode::Prompt
    };

    let spec = WorkerSpec {
        url: cli.url.clone(),
        instructions: cli.instructions.clone(),
        output_file,
        format: cli.format,
        api_key,
        shared_dir: shared_abs,
        shared_mount,
        invocation,
    };

    println!("Starting extraction from {}", cli.url);
    let supervisor = LifecycleSupervisor::new(ctx, config, escalation);
    let report = supervisor.supervise(&spec).await;

    match report.status {
        JobStatus::Completed if report.success() => {
            println!(
                "\nExtraction completed successfully in {}s",
                report.duration.as_secs()
            );
            if let Some(artifact) = &report.artifact {
                println!("Output saved to: {}", artifact.display());
            }
            ExitCode::SUCCESS
        }
        JobStatus::Completed => {
            println!("\nWorker finished but the declared output file was not found.");
            println!("Check the logs under the shared directory for details.");
            ExitCode::FAILURE
        }
        status => {
            println!(
                "\nExtraction {status} after {}s{}",
                report.duration.as_secs(),
                report
                    .error
                    .as_deref()
                    .map(|e| format!(": {e}"))
                    .unwrap_or_default()
            );
            ExitCode::FAILURE
        }
    }
}
