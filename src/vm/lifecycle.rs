//! VM lifecycle management
//!
//! One task, one disposable VM:
//!
//! ```text
//! Requested → Provisioning → WaitingReady → ConfigInjected → Running → Polling → Cleanup → Destroyed
//!                  │               │               │                        │
//!                  └───────────────┴───────────────┴──────── Failed ────────┘ → Cleanup
//! ```
//!
//! Every exit path (agent done, error, cancellation, deadline, panic) goes
//! through Cleanup. A VM that was cloned is destroyed before the run
//! reports back; if destruction itself fails the run ends in `Failed` and
//! the leak is logged and counted. The clone runs as its own task, so a run
//! cut short mid-clone waits for the VMID and destroys it.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::backoff::Backoff;
use super::client::{VirtError, VirtualizationClient, VmSpec, AGENT_TAG};
use super::gate::ProvisioningGate;
use super::guest::GuestProgressReader;
use super::handle::{VmHandle, VmPhase};
use super::lease::{destroy_with_retry, CleanupStatus, DestroyPolicy, VmLease};
use super::registry::VmRegistry;
use crate::config::Settings;
use crate::metrics::{TASKS_TOTAL, VM_PROVISION_ATTEMPTS, VM_PROVISION_DURATION};
use crate::progress::{PollOutcome, ProgressEvent, ProgressPoller, GUEST_PROGRESS_PATH};
use crate::task::{ErrorKind, TaskConfig, TaskOutcome};

pub const TASK_CONFIG_PATH: &str = "/opt/agent/task_config.json";

const DEFAULT_LAUNCH_COMMAND: &str = "cd /opt/agent && nohup ./codevisor-agent \
     --config /opt/agent/task_config.json --progress /opt/agent/progress.jsonl \
     > /opt/agent/output.log 2>&1 &";
const DEFAULT_STOP_COMMAND: &str = "pkill -f codevisor-agent || true";

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub cores: u32,
    pub memory_mb: u32,
    /// Upper bound on WaitingReady, counted from a successful start.
    pub readiness_timeout: Duration,
    pub readiness_poll_interval: Duration,
    /// Progress poll cadence.
    pub poll_interval: Duration,
    /// No new progress events for this long means the agent is gone.
    pub liveness_timeout: Duration,
    /// Per guest-exec call (progress reads, launch, stop).
    pub exec_timeout: Duration,
    pub provision_backoff: Backoff,
    pub destroy_policy: DestroyPolicy,
    /// Records of other managers stay theirs until their heartbeat is this old.
    pub orphan_grace: Duration,
    pub config_path: String,
    pub progress_path: String,
    pub launch_command: String,
    pub stop_command: String,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            cores: 2,
            memory_mb: 4096,
            readiness_timeout: Duration::from_secs(180),
            readiness_poll_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(3),
            liveness_timeout: Duration::from_secs(300),
            exec_timeout: Duration::from_secs(30),
            provision_backoff: Backoff::default(),
            destroy_policy: DestroyPolicy::default(),
            orphan_grace: Duration::from_secs(900),
            config_path: TASK_CONFIG_PATH.to_string(),
            progress_path: GUEST_PROGRESS_PATH.to_string(),
            launch_command: DEFAULT_LAUNCH_COMMAND.to_string(),
            stop_command: DEFAULT_STOP_COMMAND.to_string(),
        }
    }
}

impl LifecycleSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cores: settings.vm.cores(),
            memory_mb: settings.vm.memory_mb(),
            readiness_timeout: Duration::from_secs(settings.vm.readiness_timeout_secs),
            poll_interval: Duration::from_secs(settings.vm.poll_interval_secs.max(1)),
            liveness_timeout: Duration::from_secs(settings.vm.liveness_timeout_secs),
            orphan_grace: Duration::from_secs(settings.vm.orphan_grace_secs),
            ..Self::default()
        }
    }
}

/// Streamed to the orchestrator while a task runs.
#[derive(Debug, Clone)]
pub enum TaskUpdate {
    Phase {
        phase: VmPhase,
        at: DateTime<Utc>,
        detail: Option<String>,
    },
    /// Relayed from the agent's progress log, in `seq` order.
    Event(ProgressEvent),
    /// Always the last update of a run.
    Finished(TaskReport),
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: String,
    pub vm_id: Option<u32>,
    pub vm_name: Option<String>,
    /// `Destroyed` after a clean teardown, otherwise `Failed`.
    pub final_phase: VmPhase,
    pub outcome: TaskOutcome,
    pub cleanup: CleanupStatus,
    pub events_relayed: u64,
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("task {0} is already running")]
    DuplicateTask(String),
}

/// Result of sweeping the hypervisor for VMs no live task owns.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub destroyed: Vec<u32>,
    pub failed: Vec<(u32, String)>,
    pub skipped_active: usize,
    /// VMs another live manager still owns.
    pub skipped_owned: usize,
    /// Registry records whose VM no longer exists.
    pub stale_records: usize,
}

/// Per-run mutable state shared between the body and cleanup.
struct RunState<C: VirtualizationClient + 'static> {
    phase: VmPhase,
    lease: Option<VmLease<C>>,
    /// Clone still in flight; holds the VMID once the hypervisor returns it.
    pending_clone: Option<JoinHandle<Result<u32, VirtError>>>,
    vm_name: Option<String>,
    agent_started: bool,
    agent_finished: bool,
    relayed: u64,
}

/// Removes the task id from the active set when the run ends, however it ends.
struct ActiveTask<'a> {
    active: &'a Mutex<HashSet<String>>,
    task_id: String,
}

impl Drop for ActiveTask<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.task_id);
    }
}

pub struct VmLifecycleManager<C: VirtualizationClient + 'static> {
    client: Arc<C>,
    gate: Arc<ProvisioningGate>,
    registry: Option<Arc<VmRegistry>>,
    settings: LifecycleSettings,
    active: Mutex<HashSet<String>>,
    /// Written into every VM record this manager creates.
    owner_id: String,
}

impl<C: VirtualizationClient + 'static> VmLifecycleManager<C> {
    pub fn new(client: Arc<C>, gate: Arc<ProvisioningGate>, settings: LifecycleSettings) -> Self {
        Self {
            client,
            gate,
            registry: None,
            settings,
            active: Mutex::new(HashSet::new()),
            owner_id: format!("{}-{}", std::process::id(), Uuid::now_v7().simple()),
        }
    }

    /// Persist VM records under `registry` so a restarted process can clean up.
    pub fn with_registry(mut self, registry: Arc<VmRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn active_tasks(&self) -> Vec<String> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = active.iter().cloned().collect();
        ids.sort();
        ids
    }

    fn claim(&self, task_id: &str) -> Result<ActiveTask<'_>, LifecycleError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(task_id.to_string()) {
            return Err(LifecycleError::DuplicateTask(task_id.to_string()));
        }
        Ok(ActiveTask {
            active: &self.active,
            task_id: task_id.to_string(),
        })
    }

    /// Run `task` in a fresh VM and tear the VM down afterwards.
    ///
    /// Phase changes and relayed agent events go to `updates`; the last
    /// message is always [`TaskUpdate::Finished`]. A closed receiver does
    /// not stop the run. `cancel` aborts the task; the VM is still destroyed.
    pub async fn run(
        &self,
        task: TaskConfig,
        updates: mpsc::Sender<TaskUpdate>,
        cancel: CancellationToken,
    ) -> Result<TaskReport, LifecycleError> {
        let _active = self.claim(&task.task_id)?;

        let span = info_span!(
            "vm_lifecycle",
            task_id = %task.task_id,
            model = %task.model,
            otel.name = "vm_lifecycle"
        );
        let report = self.run_claimed(&task, &updates, cancel).instrument(span).await;

        TASKS_TOTAL
            .with_label_values(&[
                report.outcome.status.as_str(),
                report.outcome.error_kind.map(|k| k.as_str()).unwrap_or("none"),
            ])
            .inc();
        let _ = updates.send(TaskUpdate::Finished(report.clone())).await;
        Ok(report)
    }

    async fn run_claimed(
        &self,
        task: &TaskConfig,
        updates: &mpsc::Sender<TaskUpdate>,
        cancel: CancellationToken,
    ) -> TaskReport {
        let started = Instant::now();
        let mut run = RunState::<C> {
            phase: VmPhase::Requested,
            lease: None,
            pending_clone: None,
            vm_name: None,
            agent_started: false,
            agent_finished: false,
            relayed: 0,
        };
        self.transition(&mut run, VmPhase::Requested, updates, None).await;

        let outcome = match task.validate() {
            Err(e) => TaskOutcome::failed(ErrorKind::ConfigurationError, e.to_string()),
            Ok(()) => {
                tokio::select! {
                    result = AssertUnwindSafe(self.drive(task, &mut run, updates)).catch_unwind() => {
                        match result {
                            Ok(outcome) => outcome,
                            Err(panic) => {
                                let message = panic_message(panic.as_ref());
                                error!(panic = %message, "Lifecycle run panicked");
                                TaskOutcome::failed(
                                    ErrorKind::InternalError,
                                    format!("lifecycle run panicked: {message}"),
                                )
                            }
                        }
                    }
                    _ = cancel.cancelled() => {
                        info!("Task cancelled");
                        TaskOutcome::timed_out(ErrorKind::Cancelled, "cancelled by request")
                    }
                    _ = tokio::time::sleep(task.remaining()) => {
                        warn!(deadline = %task.deadline, "Task deadline reached");
                        TaskOutcome::timed_out(
                            ErrorKind::TimeoutError,
                            format!("task deadline {} passed", task.deadline.to_rfc3339()),
                        )
                    }
                }
            }
        };

        if !outcome.is_success() {
            let detail = outcome.error_kind.map(|k| k.user_message().to_string());
            self.transition(&mut run, VmPhase::Failed, updates, detail).await;
        }
        if let Some(pending) = run.pending_clone.take() {
            self.settle_clone(task, &mut run, pending).await;
        }
        if run.agent_started && !run.agent_finished {
            self.stop_agent(&run).await;
        }

        self.transition(&mut run, VmPhase::Cleanup, updates, None).await;
        let vm_id = run.lease.as_ref().map(|lease| lease.vm_id());
        let cleanup = match run.lease.take() {
            Some(lease) => lease.release().await,
            None => CleanupStatus::NotProvisioned,
        };
        let final_phase = match &cleanup {
            CleanupStatus::Destroyed => VmPhase::Destroyed,
            CleanupStatus::NotProvisioned | CleanupStatus::DestroyFailed(_) => VmPhase::Failed,
        };
        let detail = match &cleanup {
            CleanupStatus::DestroyFailed(e) => Some(format!("VM could not be destroyed: {e}")),
            _ => None,
        };
        self.transition(&mut run, final_phase, updates, detail).await;

        info!(
            status = %outcome.status,
            error_kind = outcome.error_kind.map(|k| k.as_str()).unwrap_or("none"),
            vm_id = ?vm_id,
            events = run.relayed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Task finished"
        );

        TaskReport {
            task_id: task.task_id.clone(),
            vm_id,
            vm_name: run.vm_name.clone(),
            final_phase,
            outcome,
            cleanup,
            events_relayed: run.relayed,
            duration: started.elapsed(),
        }
    }

    async fn transition(
        &self,
        run: &mut RunState<C>,
        phase: VmPhase,
        updates: &mpsc::Sender<TaskUpdate>,
        detail: Option<String>,
    ) {
        debug!(from = %run.phase, to = %phase, "VM phase change");
        run.phase = phase;
        if let Some(lease) = run.lease.as_mut() {
            lease.set_phase(phase);
        }
        let _ = updates
            .send(TaskUpdate::Phase {
                phase,
                at: Utc::now(),
                detail,
            })
            .await;
    }

    /// Provision, launch the agent and relay its events until it finishes.
    async fn drive(
        &self,
        task: &TaskConfig,
        run: &mut RunState<C>,
        updates: &mpsc::Sender<TaskUpdate>,
    ) -> TaskOutcome {
        let provision_started = Instant::now();
        self.transition(run, VmPhase::Provisioning, updates, None).await;

        let spec = VmSpec::for_task(
            &task.task_id,
            &task.short_id(),
            self.settings.cores,
            self.settings.memory_mb,
        );
        run.vm_name = Some(spec.name.clone());

        let vm_id = {
            let _permit = match self.gate.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    return TaskOutcome::failed(
                        ErrorKind::InternalError,
                        "provisioning gate closed",
                    )
                }
            };

            run.pending_clone = Some(tokio::spawn(clone_with_retry(
                self.client.clone(),
                spec.clone(),
                self.settings.provision_backoff,
            )));
            let cloned = match run.pending_clone.as_mut() {
                Some(pending) => pending.await,
                None => return TaskOutcome::failed(ErrorKind::InternalError, "clone task missing"),
            };
            run.pending_clone = None;
            let vm_id = match cloned {
                Ok(Ok(vm_id)) => vm_id,
                Ok(Err(e)) => return provisioning_failure("clone template", &e),
                Err(e) => {
                    return TaskOutcome::failed(
                        ErrorKind::InternalError,
                        format!("clone task failed: {e}"),
                    )
                }
            };
            info!(vm_id, name = %spec.name, "VM cloned");
            run.lease = Some(self.lease(task, vm_id, &spec.name));

            let client = self.client.as_ref();
            if let Err(e) = self
                .settings
                .provision_backoff
                .retry("start", move || client.start(vm_id))
                .await
            {
                return provisioning_failure("start VM", &e);
            }
            vm_id
        };

        self.transition(run, VmPhase::WaitingReady, updates, None).await;
        let ip = match self.wait_ready(vm_id, run).await {
            Ok(ip) => ip,
            Err(outcome) => return outcome,
        };
        VM_PROVISION_DURATION.observe(provision_started.elapsed().as_secs_f64());
        info!(vm_id, ip = %ip, "VM reachable");
        if let Some(lease) = run.lease.as_mut() {
            lease.set_ip(&ip);
        }

        let config_json = match task.to_json() {
            Ok(json) => json,
            Err(e) => return TaskOutcome::failed(ErrorKind::ConfigurationError, e.to_string()),
        };
        if let Err(e) = self
            .client
            .write_file(vm_id, &self.settings.config_path, &config_json)
            .await
        {
            return TaskOutcome::failed(
                ErrorKind::ProvisioningError,
                format!("failed to inject task config: {e}"),
            );
        }
        self.transition(run, VmPhase::ConfigInjected, updates, None).await;

        match self
            .client
            .exec(vm_id, &self.settings.launch_command, self.settings.exec_timeout)
            .await
        {
            Ok(result) if result.success() => {}
            Ok(result) => {
                return TaskOutcome::failed(
                    ErrorKind::ProvisioningError,
                    format!(
                        "agent launch exited with {:?}: {}",
                        result.exit_code,
                        result.stderr.trim()
                    ),
                )
            }
            Err(e) => {
                return TaskOutcome::failed(
                    ErrorKind::ProvisioningError,
                    format!("failed to launch agent: {e}"),
                )
            }
        }
        run.agent_started = true;
        self.transition(run, VmPhase::Running, updates, None).await;

        self.transition(run, VmPhase::Polling, updates, None).await;
        self.follow(vm_id, run, updates).await
    }

    fn lease(&self, task: &TaskConfig, vm_id: u32, name: &str) -> VmLease<C> {
        VmLease::new(
            self.client.clone(),
            VmHandle::new(task.task_id.clone(), vm_id, name).with_owner(self.owner_id.clone()),
            self.registry.clone(),
            self.settings.destroy_policy,
        )
    }

    /// Wait out a clone the run abandoned and take ownership of its VM.
    async fn settle_clone(
        &self,
        task: &TaskConfig,
        run: &mut RunState<C>,
        pending: JoinHandle<Result<u32, VirtError>>,
    ) {
        match pending.await {
            Ok(Ok(vm_id)) => {
                info!(vm_id, "Clone finished after the run ended; destroying it");
                let name = run.vm_name.clone().unwrap_or_default();
                run.lease = Some(self.lease(task, vm_id, &name));
            }
            Ok(Err(e)) => debug!(error = %e, "Abandoned clone failed"),
            Err(e) => warn!(error = %e, "Abandoned clone task did not complete"),
        }
    }

    async fn wait_ready(&self, vm_id: u32, run: &mut RunState<C>) -> Result<String, TaskOutcome> {
        let timeout = self.settings.readiness_timeout;
        let started = Instant::now();
        loop {
            if let Some(lease) = run.lease.as_mut() {
                lease.heartbeat();
            }
            match self.client.status(vm_id).await {
                Ok(status) if status.is_reachable() => {
                    if let Some(ip) = status.ip_address {
                        return Ok(ip);
                    }
                }
                Ok(status) => {
                    debug!(vm_id, running = status.running, agent = status.agent_ready, "VM not ready yet");
                }
                Err(VirtError::NotFound(_)) => {
                    return Err(TaskOutcome::failed(
                        ErrorKind::ProvisioningError,
                        format!("VM {vm_id} disappeared while booting"),
                    ))
                }
                Err(e @ VirtError::Auth(_)) => {
                    return Err(TaskOutcome::failed(ErrorKind::ConfigurationError, e.to_string()))
                }
                Err(e) => debug!(vm_id, error = %e, "Status check failed"),
            }

            if started.elapsed() >= timeout {
                return Err(TaskOutcome::failed(
                    ErrorKind::ReadinessTimeoutError,
                    format!(
                        "VM {vm_id} was not reachable within {}s",
                        timeout.as_secs()
                    ),
                ));
            }
            tokio::time::sleep(self.settings.readiness_poll_interval).await;
        }
    }

    /// Relay progress events until the agent's `done` event or silence.
    async fn follow(
        &self,
        vm_id: u32,
        run: &mut RunState<C>,
        updates: &mpsc::Sender<TaskUpdate>,
    ) -> TaskOutcome {
        let reader = GuestProgressReader::new(
            self.client.clone(),
            vm_id,
            self.settings.progress_path.clone(),
            self.settings.exec_timeout,
        );
        let mut poller = ProgressPoller::new(
            reader,
            self.settings.liveness_timeout,
            self.settings.exec_timeout,
        );

        loop {
            if let Some(lease) = run.lease.as_mut() {
                lease.heartbeat();
            }
            match poller.poll().await {
                PollOutcome::Events(events) => {
                    for event in events {
                        run.relayed += 1;
                        let closing = event.is_done().then(|| event.outcome().cloned());
                        let _ = updates.send(TaskUpdate::Event(event)).await;
                        if let Some(outcome) = closing {
                            run.agent_finished = true;
                            return outcome.unwrap_or_else(|| {
                                TaskOutcome::failed(
                                    ErrorKind::InternalError,
                                    "agent closed its log without an outcome",
                                )
                            });
                        }
                    }
                }
                PollOutcome::Idle => {}
                PollOutcome::Stale { silent_for } => {
                    warn!(vm_id, silent_secs = silent_for.as_secs(), "Agent stopped reporting progress");
                    return TaskOutcome::failed(
                        ErrorKind::AgentUnresponsive,
                        format!("no progress from the agent for {}s", silent_for.as_secs()),
                    );
                }
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Best effort: the VM is destroyed next anyway.
    async fn stop_agent(&self, run: &RunState<C>) {
        let Some(lease) = run.lease.as_ref() else {
            return;
        };
        let call = self
            .client
            .exec(lease.vm_id(), &self.settings.stop_command, self.settings.exec_timeout);
        match tokio::time::timeout(self.settings.exec_timeout, call).await {
            Ok(Ok(_)) => debug!(vm_id = lease.vm_id(), "Agent stopped"),
            Ok(Err(e)) => debug!(vm_id = lease.vm_id(), error = %e, "Could not stop agent"),
            Err(_) => debug!(vm_id = lease.vm_id(), "Stopping agent timed out"),
        }
    }

    /// Destroy agent VMs that no running task owns and drop stale records.
    ///
    /// A VM is left alone while its task runs here, while its record names
    /// another manager whose heartbeat is younger than `orphan_grace`, or,
    /// with no record at all, while its task id is younger than
    /// `orphan_grace` (the clone may not have returned yet).
    pub async fn reconcile_orphans(&self) -> Result<ReconcileReport, VirtError> {
        let grace = self.settings.orphan_grace;
        let tagged = self.client.list_tagged(AGENT_TAG).await?;
        let active: HashSet<String> = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let records = match &self.registry {
            Some(registry) => registry.list().unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read VM registry");
                Vec::new()
            }),
            None => Vec::new(),
        };
        let tagged_ids: HashSet<u32> = tagged.iter().map(|vm| vm.vm_id).collect();

        let mut report = ReconcileReport::default();
        for vm in &tagged {
            let record = records.iter().find(|r| r.vm_id == vm.vm_id);
            let owner = vm
                .task_id()
                .map(str::to_string)
                .or_else(|| record.map(|r| r.task_id.clone()));
            if owner.as_ref().is_some_and(|id| active.contains(id)) {
                report.skipped_active += 1;
                continue;
            }
            let held = match record {
                Some(record) => record.held_by_other(&self.owner_id, grace),
                None => owner.as_deref().is_some_and(|id| task_is_recent(id, grace)),
            };
            if held {
                debug!(vm_id = vm.vm_id, task_id = ?owner, "VM belongs to another live manager");
                report.skipped_owned += 1;
                continue;
            }

            let handle = record
                .cloned()
                .unwrap_or_else(|| VmHandle::new(owner.unwrap_or_default(), vm.vm_id, vm.name.clone()));
            info!(vm_id = vm.vm_id, task_id = %handle.task_id, age_secs = handle.age().num_seconds(), "Destroying orphaned agent VM");

            match destroy_with_retry(
                self.client.as_ref(),
                &handle,
                self.registry.as_deref(),
                &self.settings.destroy_policy,
            )
            .await
            {
                CleanupStatus::Destroyed => report.destroyed.push(vm.vm_id),
                CleanupStatus::DestroyFailed(e) => report.failed.push((vm.vm_id, e)),
                CleanupStatus::NotProvisioned => {}
            }
        }

        if let Some(registry) = &self.registry {
            for record in records {
                if active.contains(&record.task_id)
                    || tagged_ids.contains(&record.vm_id)
                    || record.held_by_other(&self.owner_id, grace)
                {
                    continue;
                }
                match registry.remove(&record.task_id) {
                    Ok(()) => report.stale_records += 1,
                    Err(e) => warn!(task_id = %record.task_id, error = %e, "Failed to remove stale record"),
                }
            }
        }

        info!(
            destroyed = report.destroyed.len(),
            failed = report.failed.len(),
            skipped = report.skipped_active,
            skipped_owned = report.skipped_owned,
            stale_records = report.stale_records,
            "Reconcile finished"
        );
        Ok(report)
    }
}

async fn clone_with_retry<C: VirtualizationClient + 'static>(
    client: Arc<C>,
    spec: VmSpec,
    backoff: Backoff,
) -> Result<u32, VirtError> {
    let client = client.as_ref();
    let spec = &spec;
    backoff
        .retry("clone", move || async move {
            let result = client.clone_template(spec).await;
            let label = match &result {
                Ok(_) => "ok",
                Err(e) if e.is_retryable() => "retry",
                Err(_) => "failed",
            };
            VM_PROVISION_ATTEMPTS.with_label_values(&[label]).inc();
            result
        })
        .await
}

/// Whether `task_id` is a time-ordered id minted less than `grace` ago.
fn task_is_recent(task_id: &str, grace: Duration) -> bool {
    let Some(timestamp) = Uuid::parse_str(task_id).ok().and_then(|id| id.get_timestamp()) else {
        return false;
    };
    let (secs, nanos) = timestamp.to_unix();
    let minted = UNIX_EPOCH + Duration::new(secs, nanos);
    match SystemTime::now().duration_since(minted) {
        Ok(age) => age < grace,
        Err(_) => true,
    }
}

/// Map an exhausted or fatal provisioning error to the taxonomy.
fn provisioning_failure(step: &str, e: &VirtError) -> TaskOutcome {
    let kind = if e.is_retryable() {
        ErrorKind::ProvisioningError
    } else {
        ErrorKind::ConfigurationError
    };
    error!(step, error = %e, kind = kind.as_str(), "Provisioning failed");
    TaskOutcome::failed(kind, format!("failed to {step}: {e}"))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
