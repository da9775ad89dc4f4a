//! Codevisor orchestrator CLI.
//!
//! ```text
//! codevisor run --message "Add a /health endpoint to https://github.com/user/api"
//! codevisor reconcile
//! codevisor detect --message "fix the login bug in https://github.com/user/webapp branch: dev"
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use codevisor::config::Settings;
use codevisor::metrics;
use codevisor::orchestrator::{render_header, render_missing_repository, render_update, Detection, Orchestrator};
use codevisor::task::TerminalStatus;
use codevisor::tracing::{init_tracing, shutdown_tracing};
use codevisor::vm::{
    LifecycleSettings, ProvisioningGate, ProxmoxClient, TaskUpdate, VmLifecycleManager, VmRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "codevisor", version, about = "Run coding tasks in disposable Proxmox VMs")]
struct Cli {
    /// Optional TOML settings file; environment variables override it
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Print Prometheus metrics when the command finishes
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect a task in a chat message and run it
    Run {
        #[arg(long)]
        message: String,
        /// Model id for the agent (defaults to DEFAULT_MODEL)
        #[arg(long)]
        model: Option<String>,
    },
    /// Destroy agent VMs no running task owns
    Reconcile {
        /// Treat records silent for this long as abandoned (defaults to ORPHAN_GRACE_SECS)
        #[arg(long)]
        grace_secs: Option<u64>,
    },
    /// Print the task parsed from a message without provisioning anything
    Detect {
        #[arg(long)]
        message: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Command::Detect { message } = &cli.command {
        return detect(message);
    }

    let mut settings = match Settings::load(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };
    if let Command::Reconcile { grace_secs: Some(secs) } = &cli.command {
        settings.vm.orphan_grace_secs = *secs;
    }
    if let Err(e) = init_tracing("codevisor", settings.otlp_endpoint.as_deref()) {
        eprintln!("failed to initialize tracing: {e}");
    }

    let code = match build_manager(&settings) {
        Ok(manager) => match cli.command {
            Command::Run { message, model } => run(manager, &settings, &message, model.as_deref()).await,
            Command::Reconcile { .. } => reconcile(&manager).await,
            Command::Detect { .. } => 0,
        },
        Err(e) => {
            error!(error = %e, "Failed to initialize");
            1
        }
    };

    if cli.print_metrics {
        println!("{}", metrics::encode());
    }
    shutdown_tracing();
    ExitCode::from(code)
}

fn detect(message: &str) -> ExitCode {
    let detection = codevisor::orchestrator::detect(message);
    match serde_json::to_string_pretty(&detection) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("failed to encode detection: {e}");
            return ExitCode::from(1);
        }
    }
    match detection {
        Detection::Task(_) => ExitCode::SUCCESS,
        _ => ExitCode::from(1),
    }
}

fn build_manager(
    settings: &Settings,
) -> Result<Arc<VmLifecycleManager<ProxmoxClient>>, Box<dyn std::error::Error + Send + Sync>> {
    let client = Arc::new(ProxmoxClient::from_settings(&settings.proxmox)?);
    let gate = Arc::new(ProvisioningGate::new(
        settings.max_concurrent_provisions,
        settings.max_concurrent_provisions as u64,
        settings.provisions_per_second,
    ));
    let registry = Arc::new(VmRegistry::new(settings.registry_dir())?);
    let manager = VmLifecycleManager::new(client, gate, LifecycleSettings::from_settings(settings))
        .with_registry(registry);
    Ok(Arc::new(manager))
}

async fn run(
    manager: Arc<VmLifecycleManager<ProxmoxClient>>,
    settings: &Settings,
    message: &str,
    model: Option<&str>,
) -> u8 {
    let orchestrator = Orchestrator::from_settings(manager, settings);
    let mut handle = match orchestrator.submit_message(message, model) {
        Ok(handle) => handle,
        Err(Detection::MissingRepository) => {
            println!("{}", render_missing_repository());
            return 1;
        }
        Err(_) => {
            println!("No coding task detected in the message.");
            return 1;
        }
    };
    print!("{}", render_header(&handle.task));

    let mut status = None;
    loop {
        tokio::select! {
            update = handle.updates.recv() => {
                let Some(update) = update else { break };
                if let Some(text) = render_update(&update) {
                    print!("{text}");
                }
                if let TaskUpdate::Finished(report) = update {
                    status = Some(report.outcome.status);
                }
            }
            _ = tokio::signal::ctrl_c(), if !handle.cancel.is_cancelled() => {
                info!("Interrupt received, cancelling task");
                handle.cancel();
            }
        }
    }

    if let Err(e) = handle.join.await {
        error!(error = %e, "Task runner aborted");
        return 1;
    }
    match status {
        Some(TerminalStatus::Succeeded) => 0,
        Some(TerminalStatus::TimedOut) => 2,
        _ => 1,
    }
}

async fn reconcile(manager: &VmLifecycleManager<ProxmoxClient>) -> u8 {
    match manager.reconcile_orphans().await {
        Ok(report) => {
            println!(
                "destroyed {} orphaned VM(s), {} failed, {} owned elsewhere, {} stale record(s) removed",
                report.destroyed.len(),
                report.failed.len(),
                report.skipped_owned,
                report.stale_records
            );
            for (vm_id, e) in &report.failed {
                println!("  VM {vm_id}: {e}");
            }
            if report.failed.is_empty() {
                0
            } else {
                1
            }
        }
        Err(e) => {
            error!(error = %e, "Reconcile failed");
            1
        }
    }
}
