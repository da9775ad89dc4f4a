//! Codevisor - autonomous coding tasks in disposable Proxmox VMs
//!
//! A chat request becomes a [`TaskConfig`]; the orchestrator provisions a VM
//! for it, the in-VM agent loop edits, tests and commits under a command
//! safety gate, progress streams back through an append-only event log, and
//! the VM is destroyed whatever the outcome.
//!
//! # Modules
//!
//! - `task` - Task request, outcome and error taxonomy
//! - `safety` - Command safety gate for agent-proposed shell commands
//! - `progress` - Append-only progress channel and its poller
//! - `llm` - OpenAI-compatible chat client and tool schemas
//! - `agent` - In-VM agent execution loop
//! - `vm` - Hypervisor client and VM lifecycle manager
//! - `orchestrator` - Task detection, submission and chat rendering
//! - `config` - Settings from TOML and environment
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - Console logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use codevisor::{
//!     LifecycleSettings, Orchestrator, ProvisioningGate, ProxmoxClient, Settings, VmLifecycleManager,
//! };
//!
//! let settings = Settings::load(None)?;
//! let client = Arc::new(ProxmoxClient::from_settings(&settings.proxmox)?);
//! let gate = Arc::new(ProvisioningGate::new(4, 2, 0.5));
//! let manager = Arc::new(VmLifecycleManager::new(client, gate, LifecycleSettings::from_settings(&settings)));
//! let orchestrator = Orchestrator::from_settings(manager, &settings);
//! let handle = orchestrator.submit_message("Add a /health endpoint to https://github.com/user/api", None)?;
//! ```

pub mod agent;
pub mod config;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod safety;
pub mod task;
pub mod tracing;
pub mod vm;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentLoop, AgentSettings};
pub use config::{ConfigError, Settings};
pub use llm::{ChatClient, LlmClient};
pub use orchestrator::{detect, Detection, Orchestrator, TaskHandle};
pub use progress::{ProgressEvent, ProgressPoller, ProgressWriter};
pub use safety::{evaluate, CommandVerdict, SafetyPolicy, Verdict};
pub use task::{ErrorKind, TaskConfig, TaskOutcome, TerminalStatus};
pub use vm::{
    LifecycleSettings, ProvisioningGate, ProxmoxClient, TaskReport, TaskUpdate,
    VirtualizationClient, VmLifecycleManager,
};
