//! In-VM agent runtime.
//!
//! Reads the injected task config, runs the agent loop against it and writes
//! every observation to the progress log. Also usable on a workstation:
//!
//! ```text
//! codevisor-agent --config task.json --progress /tmp/progress.jsonl --workspace /tmp/ws
//! ```
//!
//! Exit codes: 0 succeeded, 1 failed, 2 timed out, 3 config or log unusable.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use codevisor::agent::{AgentLoop, AgentSettings};
use codevisor::llm::ChatClient;
use codevisor::progress::{FileProgressLog, ProgressWriter, GUEST_PROGRESS_PATH};
use codevisor::task::{ErrorKind, TaskConfig, TaskOutcome, TerminalStatus};
use codevisor::tracing::{init_tracing, shutdown_tracing};
use codevisor::vm::TASK_CONFIG_PATH;

const EXIT_CONFIG: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "codevisor-agent", version, about = "Autonomous coding agent (runs inside the task VM)")]
struct Args {
    /// Task config JSON injected by the orchestrator
    #[arg(long, default_value = TASK_CONFIG_PATH)]
    config: PathBuf,

    /// Progress log (JSON lines) read by the orchestrator
    #[arg(long, default_value = GUEST_PROGRESS_PATH)]
    progress: PathBuf,

    /// Directory the repository is cloned into
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// OTLP collector for span export
    #[arg(long)]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_tracing("codevisor-agent", args.otlp_endpoint.as_deref()) {
        eprintln!("failed to initialize tracing: {e}");
    }

    let code = run(args).await;
    shutdown_tracing();
    ExitCode::from(code)
}

async fn run(args: Args) -> u8 {
    let store = match FileProgressLog::create(&args.progress).await {
        Ok(store) => store,
        Err(e) => {
            error!(path = %args.progress.display(), error = %e, "Cannot open progress log");
            return EXIT_CONFIG;
        }
    };

    let task = match TaskConfig::load(&args.config) {
        Ok(task) => task,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "Cannot load task config");
            report_early_failure(store, ErrorKind::ConfigurationError, e.to_string()).await;
            return EXIT_CONFIG;
        }
    };

    let mut settings = AgentSettings::default();
    if let Some(workspace) = args.workspace {
        settings.workspace_dir = workspace;
    }

    let llm = match ChatClient::new(&task.llm_endpoint, task.llm_api_key.clone(), settings.llm_timeout) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Cannot build LLM client");
            report_early_failure(store, ErrorKind::ConfigurationError, e.to_string()).await;
            return EXIT_CONFIG;
        }
    };

    info!(task_id = %task.task_id, model = %task.model, "Agent starting");
    let report = AgentLoop::new(llm, store, settings).run(&task).await;
    info!(
        task_id = %task.task_id,
        status = %report.outcome.status,
        steps = report.steps.len(),
        "Agent finished"
    );

    match report.outcome.status {
        TerminalStatus::Succeeded => 0,
        TerminalStatus::Failed => 1,
        TerminalStatus::TimedOut => 2,
    }
}

/// Close the progress log so the orchestrator sees the failure instead of silence.
async fn report_early_failure(store: FileProgressLog, kind: ErrorKind, reason: String) {
    let mut writer = ProgressWriter::new(store);
    if let Err(e) = writer.done(TaskOutcome::failed(kind, reason)).await {
        error!(error = %e, "Failed to write closing progress event");
    }
}
