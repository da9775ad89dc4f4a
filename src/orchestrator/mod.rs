//! Task Orchestrator
//!
//! Thin layer between chat and the VM lifecycle: recognizes a coding request,
//! turns it into a [`TaskConfig`], starts a lifecycle run and renders its
//! updates as markdown. Each submitted task runs on its own tokio task with
//! its own cancel token; tasks share nothing but the hypervisor client and
//! the provisioning gate.

pub mod detect;
pub mod render;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Settings;
use crate::task::TaskConfig;
use crate::vm::{LifecycleError, TaskReport, TaskUpdate, VirtualizationClient, VmLifecycleManager};

pub use detect::{detect, extract_description, extract_repository, is_coding_task, Detection, TaskRequest};
pub use render::{render_event, render_header, render_missing_repository, render_summary, render_update};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// A running task.
pub struct TaskHandle {
    pub task: TaskConfig,
    /// Phase changes, relayed events, then exactly one `Finished`.
    pub updates: mpsc::Receiver<TaskUpdate>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<Result<TaskReport, LifecycleError>>,
}

impl TaskHandle {
    /// Ask the run to stop. The VM is still torn down.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct Orchestrator<C: VirtualizationClient + 'static> {
    manager: Arc<VmLifecycleManager<C>>,
    llm_endpoint: String,
    llm_api_key: String,
    default_model: String,
    max_task_duration: Duration,
}

impl<C: VirtualizationClient + 'static> Orchestrator<C> {
    pub fn new(
        manager: Arc<VmLifecycleManager<C>>,
        llm_endpoint: impl Into<String>,
        llm_api_key: impl Into<String>,
        default_model: impl Into<String>,
        max_task_duration: Duration,
    ) -> Self {
        Self {
            manager,
            llm_endpoint: llm_endpoint.into(),
            llm_api_key: llm_api_key.into(),
            default_model: default_model.into(),
            max_task_duration,
        }
    }

    pub fn from_settings(manager: Arc<VmLifecycleManager<C>>, settings: &Settings) -> Self {
        Self::new(
            manager,
            settings.llm.api_url.clone(),
            settings.llm.api_key.clone(),
            settings.llm.default_model.clone(),
            settings.max_task_duration(),
        )
    }

    pub fn manager(&self) -> &Arc<VmLifecycleManager<C>> {
        &self.manager
    }

    /// Fresh task for `request`. The model id is passed through as given.
    pub fn task_for(&self, request: &TaskRequest, model: Option<&str>) -> TaskConfig {
        TaskConfig::new(
            request.repository_url.clone(),
            request.branch.clone(),
            request.description.clone(),
            model.unwrap_or(&self.default_model),
            self.llm_endpoint.clone(),
            self.llm_api_key.clone(),
            self.max_task_duration,
        )
    }

    /// Start a lifecycle run for `task` in the background.
    pub fn submit(&self, task: TaskConfig) -> TaskHandle {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let manager = self.manager.clone();
        let run_task = task.clone();
        let run_cancel = cancel.clone();

        info!(task_id = %task.task_id, repository = %task.repository_url, branch = %task.branch, "Submitting task");
        let join = tokio::spawn(async move { manager.run(run_task, tx, run_cancel).await });

        TaskHandle {
            task,
            updates: rx,
            cancel,
            join,
        }
    }

    /// Detect a task in `message` and submit it. Returns the detection
    /// result instead when the message is not a runnable task.
    pub fn submit_message(&self, message: &str, model: Option<&str>) -> Result<TaskHandle, Detection> {
        match detect(message) {
            Detection::Task(request) => Ok(self.submit(self.task_for(&request, model))),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TerminalStatus;
    use crate::vm::{FakeVirtualization, LifecycleSettings, ProvisioningGate};

    #[tokio::test]
    async fn test_submit_message_rejects_chat() {
        let manager = Arc::new(VmLifecycleManager::new(
            Arc::new(FakeVirtualization::new()),
            Arc::new(ProvisioningGate::new(1, 1, 1.0)),
            LifecycleSettings::default(),
        ));
        let orchestrator = Orchestrator::new(manager, "http://llm/api", "", "qwen", Duration::from_secs(60));

        assert!(matches!(
            orchestrator.submit_message("good morning", None),
            Err(Detection::NotATask)
        ));
        assert!(matches!(
            orchestrator.submit_message("please implement the export feature", None),
            Err(Detection::MissingRepository)
        ));
    }

    #[tokio::test]
    async fn test_task_for_passes_model_through() {
        let manager = Arc::new(VmLifecycleManager::new(
            Arc::new(FakeVirtualization::new()),
            Arc::new(ProvisioningGate::new(1, 1, 1.0)),
            LifecycleSettings::default(),
        ));
        let orchestrator = Orchestrator::new(manager, "http://llm/api", "k", "qwen", Duration::from_secs(60));
        let request = TaskRequest {
            repository_url: "https://github.com/u/r".into(),
            branch: "dev".into(),
            description: "add a feature".into(),
        };

        let task = orchestrator.task_for(&request, Some("llama3.1:70b"));
        assert_eq!(task.model, "llama3.1:70b");
        assert_eq!(task.branch, "dev");
        assert!(task.validate().is_ok());
        assert_eq!(orchestrator.task_for(&request, None).model, "qwen");
    }

    #[tokio::test]
    async fn test_cancelled_submission_finishes() {
        let fake = Arc::new(FakeVirtualization::new().never_ready());
        let manager = Arc::new(VmLifecycleManager::new(
            fake.clone(),
            Arc::new(ProvisioningGate::new(1, 1, 1.0)),
            LifecycleSettings {
                readiness_poll_interval: Duration::from_millis(5),
                ..LifecycleSettings::default()
            },
        ));
        let orchestrator = Orchestrator::new(manager, "http://llm/api", "", "qwen", Duration::from_secs(60));
        let mut handle = orchestrator
            .submit_message("Fix the parser bug in https://github.com/u/r", None)
            .unwrap();

        let mut saw_waiting = false;
        while let Some(update) = handle.updates.recv().await {
            match update {
                TaskUpdate::Phase { phase: crate::vm::VmPhase::WaitingReady, .. } => {
                    saw_waiting = true;
                    handle.cancel();
                }
                TaskUpdate::Finished(report) => {
                    assert_eq!(report.outcome.status, TerminalStatus::TimedOut);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_waiting);
        let report = handle.join.await.unwrap().unwrap();
        assert!(report.cleanup.is_destroyed());
        assert!(fake.live().is_empty());
    }
}
