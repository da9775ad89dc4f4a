//! Integration tests for the VM lifecycle manager
//!
//! All runs use the in-memory hypervisor and millisecond timings.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use codevisor::progress::{MemoryProgressLog, ProgressEvent, ProgressWriter};
use codevisor::task::{ErrorKind, TaskConfig, TaskOutcome, TerminalStatus};
use codevisor::vm::{
    Backoff, CleanupStatus, DestroyPolicy, FakeVirtualization, LifecycleError, LifecycleSettings,
    ProvisioningGate, TaskReport, TaskUpdate, VirtError, VmHandle, VmLifecycleManager, VmPhase,
    VmRegistry,
};

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

fn fast_backoff(max_attempts: u32) -> Backoff {
    Backoff {
        max_attempts,
        base: Duration::from_millis(1),
        cap: Duration::from_millis(5),
    }
}

fn fast_settings() -> LifecycleSettings {
    LifecycleSettings {
        readiness_timeout: Duration::from_secs(2),
        readiness_poll_interval: Duration::from_millis(5),
        poll_interval: Duration::from_millis(5),
        liveness_timeout: Duration::from_secs(2),
        exec_timeout: Duration::from_secs(1),
        provision_backoff: fast_backoff(4),
        destroy_policy: DestroyPolicy {
            backoff: fast_backoff(3),
        },
        ..LifecycleSettings::default()
    }
}

fn manager(fake: FakeVirtualization, settings: LifecycleSettings) -> VmLifecycleManager<FakeVirtualization> {
    let gate = Arc::new(ProvisioningGate::new(4, 100, 1000.0));
    VmLifecycleManager::new(Arc::new(fake), gate, settings)
}

fn task() -> TaskConfig {
    TaskConfig::new(
        "https://github.com/acme/app",
        "main",
        "Add a health endpoint",
        "test-model",
        "http://llm.invalid/api",
        "",
        Duration::from_secs(60),
    )
}

/// Progress log of an agent that wrote one file and finished with `outcome`.
async fn agent_log(outcome: TaskOutcome) -> Vec<ProgressEvent> {
    let log = Arc::new(MemoryProgressLog::new());
    let mut writer = ProgressWriter::new(log.clone());
    writer.info("Cloning https://github.com/acme/app").await.unwrap();
    writer.thought("Looking for the router").await.unwrap();
    writer.tool("Wrote src/health.rs (120 bytes)", None).await.unwrap();
    writer.done(outcome).await.unwrap();
    log.events()
}

fn succeeded() -> TaskOutcome {
    TaskOutcome::succeeded("Added /health", vec!["src/health.rs".to_string()], Some("abc123".to_string()))
}

async fn run_to_end(
    manager: &VmLifecycleManager<FakeVirtualization>,
    task: TaskConfig,
) -> (TaskReport, Vec<TaskUpdate>) {
    let (tx, mut rx) = mpsc::channel(256);
    let report = manager
        .run(task, tx, CancellationToken::new())
        .await
        .expect("task is not a duplicate");
    let mut updates = Vec::new();
    while let Some(update) = rx.recv().await {
        updates.push(update);
    }
    (report, updates)
}

fn phases(updates: &[TaskUpdate]) -> Vec<VmPhase> {
    updates
        .iter()
        .filter_map(|u| match u {
            TaskUpdate::Phase { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect()
}

fn relayed(updates: &[TaskUpdate]) -> Vec<u64> {
    updates
        .iter()
        .filter_map(|u| match u {
            TaskUpdate::Event(event) => Some(event.seq),
            _ => None,
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Happy path
// ─────────────────────────────────────────────────────────────────────────────

/// Full run: every phase in order, all events relayed, VM destroyed
#[tokio::test]
async fn test_successful_run_walks_every_phase() {
    let fake = FakeVirtualization::new()
        .with_ready_after(2)
        .with_progress(&agent_log(succeeded()).await)
        .with_reveal_per_read(1);
    let manager = manager(fake, fast_settings());

    let (report, updates) = run_to_end(&manager, task()).await;

    assert_eq!(report.outcome.status, TerminalStatus::Succeeded);
    assert_eq!(report.outcome.commit.as_deref(), Some("abc123"));
    assert_eq!(report.final_phase, VmPhase::Destroyed);
    assert_eq!(report.cleanup, CleanupStatus::Destroyed);
    assert_eq!(report.events_relayed, 4);
    assert!(report.vm_name.as_deref().unwrap().starts_with("agent-"));

    assert_eq!(
        phases(&updates),
        vec![
            VmPhase::Requested,
            VmPhase::Provisioning,
            VmPhase::WaitingReady,
            VmPhase::ConfigInjected,
            VmPhase::Running,
            VmPhase::Polling,
            VmPhase::Cleanup,
            VmPhase::Destroyed,
        ]
    );
    assert_eq!(relayed(&updates), vec![1, 2, 3, 4]);
    assert!(matches!(updates.last(), Some(TaskUpdate::Finished(_))));

    let client = manager.client();
    let vm_id = report.vm_id.unwrap();
    assert_eq!(client.created(), vec![vm_id]);
    assert_eq!(client.destroyed(), vec![vm_id]);
    assert!(client.live().is_empty());
    assert!(manager.active_tasks().is_empty());
}

/// An agent-side failure is reported as is and the VM still goes away
#[tokio::test]
async fn test_agent_failure_outcome_is_relayed() {
    let outcome = TaskOutcome::failed(ErrorKind::VerificationFailure, "`cargo test` still failing");
    let fake = FakeVirtualization::new().with_progress(&agent_log(outcome).await);
    let manager = manager(fake, fast_settings());

    let (report, updates) = run_to_end(&manager, task()).await;

    assert_eq!(report.outcome.error_kind, Some(ErrorKind::VerificationFailure));
    assert_eq!(report.cleanup, CleanupStatus::Destroyed);
    let phases = phases(&updates);
    assert!(phases.contains(&VmPhase::Failed));
    assert_eq!(phases.last(), Some(&VmPhase::Destroyed));
}

/// Records are written while the VM exists and removed once it is gone
#[tokio::test]
async fn test_registry_is_empty_after_clean_run() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(VmRegistry::new(dir.path()).unwrap());
    let fake = FakeVirtualization::new().with_progress(&agent_log(succeeded()).await);
    let manager = manager(fake, fast_settings()).with_registry(registry.clone());

    let (report, _) = run_to_end(&manager, task()).await;

    assert!(report.outcome.is_success());
    assert!(registry.list().unwrap().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Provisioning and readiness
// ─────────────────────────────────────────────────────────────────────────────

/// Transient clone failures are retried until the clone succeeds
#[tokio::test]
async fn test_transient_clone_errors_are_retried() {
    let fake = FakeVirtualization::new()
        .with_clone_error(VirtError::Timeout("clone task".into()))
        .with_clone_error(VirtError::Transport("connection reset".into()))
        .with_progress(&agent_log(succeeded()).await);
    let manager = manager(fake, fast_settings());

    let (report, _) = run_to_end(&manager, task()).await;

    assert!(report.outcome.is_success());
    assert_eq!(manager.client().created().len(), 1);
}

/// Running out of clone attempts is a provisioning error with nothing to clean up
#[tokio::test]
async fn test_exhausted_clone_retries_fail_provisioning() {
    let mut fake = FakeVirtualization::new();
    for _ in 0..4 {
        fake = fake.with_clone_error(VirtError::Api {
            status: 503,
            body: "cluster busy".into(),
        });
    }
    let manager = manager(fake, fast_settings());

    let (report, updates) = run_to_end(&manager, task()).await;

    assert_eq!(report.outcome.status, TerminalStatus::Failed);
    assert_eq!(report.outcome.error_kind, Some(ErrorKind::ProvisioningError));
    assert_eq!(report.cleanup, CleanupStatus::NotProvisioned);
    assert_eq!(report.vm_id, None);
    assert!(manager.client().created().is_empty());
    assert!(!phases(&updates).contains(&VmPhase::WaitingReady));
}

/// Bad credentials are not retried
#[tokio::test]
async fn test_auth_failure_is_configuration_error() {
    let fake = FakeVirtualization::new().with_clone_error(VirtError::Auth("invalid token".into()));
    let manager = manager(fake, fast_settings());

    let (report, _) = run_to_end(&manager, task()).await;

    assert_eq!(report.outcome.error_kind, Some(ErrorKind::ConfigurationError));
    assert!(manager.client().created().is_empty());
}

/// A slow clone does not eat into the readiness budget
#[tokio::test]
async fn test_slow_clone_keeps_full_readiness_budget() {
    let settings = LifecycleSettings {
        readiness_timeout: Duration::from_millis(100),
        ..fast_settings()
    };
    let fake = FakeVirtualization::new()
        .with_clone_delay(Duration::from_millis(150))
        .with_ready_after(2)
        .with_progress(&agent_log(succeeded()).await);
    let manager = manager(fake, settings);

    let (report, _) = run_to_end(&manager, task()).await;

    assert!(report.outcome.is_success(), "{:?}", report.outcome);
    assert_eq!(report.final_phase, VmPhase::Destroyed);
}

/// A VM that never becomes reachable is destroyed after the readiness timeout
#[tokio::test]
async fn test_readiness_timeout_destroys_vm() {
    let settings = LifecycleSettings {
        readiness_timeout: Duration::from_millis(50),
        ..fast_settings()
    };
    let manager = manager(FakeVirtualization::new().never_ready(), settings);

    let (report, updates) = run_to_end(&manager, task()).await;

    assert_eq!(report.outcome.error_kind, Some(ErrorKind::ReadinessTimeoutError));
    assert_eq!(report.final_phase, VmPhase::Destroyed);
    assert!(manager.client().live().is_empty());
    assert!(!phases(&updates).contains(&VmPhase::ConfigInjected));
}

/// An invalid task never reaches the hypervisor
#[tokio::test]
async fn test_invalid_task_is_configuration_error() {
    let manager = manager(FakeVirtualization::new(), fast_settings());
    let mut task = task();
    task.branch = "--upload-pack=evil".to_string();

    let (report, _) = run_to_end(&manager, task).await;

    assert_eq!(report.outcome.error_kind, Some(ErrorKind::ConfigurationError));
    assert!(manager.client().created().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Abnormal exits
// ─────────────────────────────────────────────────────────────────────────────

/// A panic mid-run still ends in cleanup
#[tokio::test]
async fn test_panic_during_injection_still_destroys_vm() {
    let manager = manager(FakeVirtualization::new().with_panic_on_write(), fast_settings());

    let (report, updates) = run_to_end(&manager, task()).await;

    assert_eq!(report.outcome.error_kind, Some(ErrorKind::InternalError));
    assert!(report.outcome.reason.contains("injected failure"));
    assert_eq!(report.cleanup, CleanupStatus::Destroyed);
    assert!(manager.client().live().is_empty());
    assert!(matches!(updates.last(), Some(TaskUpdate::Finished(_))));
}

/// An agent that stops writing progress is declared unresponsive
#[tokio::test]
async fn test_silent_agent_is_unresponsive() {
    let settings = LifecycleSettings {
        liveness_timeout: Duration::from_millis(60),
        ..fast_settings()
    };
    let manager = manager(FakeVirtualization::new(), settings);

    let (report, _) = run_to_end(&manager, task()).await;

    assert_eq!(report.outcome.error_kind, Some(ErrorKind::AgentUnresponsive));
    assert_eq!(report.final_phase, VmPhase::Destroyed);
    assert!(manager.client().live().is_empty());
}

/// Cancellation while waiting for the VM ends the run as timed out
#[tokio::test]
async fn test_cancel_destroys_vm() {
    let manager = Arc::new(manager(FakeVirtualization::new().never_ready(), fast_settings()));
    let (tx, mut rx) = mpsc::channel(256);
    let cancel = CancellationToken::new();

    let runner = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(task(), tx, cancel).await })
    };
    while let Some(update) = rx.recv().await {
        if matches!(update, TaskUpdate::Phase { phase: VmPhase::WaitingReady, .. }) {
            break;
        }
    }
    cancel.cancel();

    let report = runner.await.unwrap().unwrap();
    assert_eq!(report.outcome.status, TerminalStatus::TimedOut);
    assert_eq!(report.outcome.error_kind, Some(ErrorKind::Cancelled));
    assert_eq!(report.cleanup, CleanupStatus::Destroyed);
    assert!(manager.client().live().is_empty());
}

/// Cancelling while the clone is still in flight waits for the VMID and destroys it
#[tokio::test]
async fn test_cancel_during_clone_destroys_vm() {
    let fake = FakeVirtualization::new().with_clone_delay(Duration::from_millis(300));
    let manager = Arc::new(manager(fake, fast_settings()));
    let (tx, mut rx) = mpsc::channel(256);
    let cancel = CancellationToken::new();

    let runner = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(task(), tx, cancel).await })
    };
    while let Some(update) = rx.recv().await {
        if matches!(update, TaskUpdate::Phase { phase: VmPhase::Provisioning, .. }) {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.client().created().len(), 1, "clone is in flight");
    cancel.cancel();

    let report = runner.await.unwrap().unwrap();
    let client = manager.client();
    assert_eq!(report.outcome.error_kind, Some(ErrorKind::Cancelled));
    assert_eq!(report.cleanup, CleanupStatus::Destroyed);
    assert_eq!(report.final_phase, VmPhase::Destroyed);
    assert_eq!(report.vm_id, client.created().first().copied());
    assert_eq!(client.destroyed(), client.created());
    assert!(client.live().is_empty());
}

/// The task deadline bounds the whole run
#[tokio::test]
async fn test_deadline_times_out_run() {
    let manager = manager(FakeVirtualization::new(), fast_settings());
    let mut task = task();
    task.deadline = task.created_at + chrono::Duration::milliseconds(100);

    let (report, _) = run_to_end(&manager, task).await;

    assert_eq!(report.outcome.status, TerminalStatus::TimedOut);
    assert_eq!(report.outcome.error_kind, Some(ErrorKind::TimeoutError));
    assert!(manager.client().live().is_empty());
}

/// The same task id cannot run twice at once
#[tokio::test]
async fn test_duplicate_task_is_rejected() {
    let manager = Arc::new(manager(FakeVirtualization::new().never_ready(), fast_settings()));
    let task = task();
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(256);

    let runner = {
        let manager = manager.clone();
        let task = task.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(task, tx, cancel).await })
    };
    rx.recv().await.expect("first phase update");
    assert_eq!(manager.active_tasks(), vec![task.task_id.clone()]);

    let (tx2, _rx2) = mpsc::channel(16);
    let second = manager.run(task.clone(), tx2, CancellationToken::new()).await;
    assert!(matches!(second, Err(LifecycleError::DuplicateTask(id)) if id == task.task_id));

    cancel.cancel();
    while rx.recv().await.is_some() {}
    runner.await.unwrap().unwrap();
    assert!(manager.active_tasks().is_empty());
}

/// A VM that cannot be destroyed is reported, not hidden
#[tokio::test]
async fn test_destroy_failure_is_reported() {
    let mut fake = FakeVirtualization::new().with_progress(&agent_log(succeeded()).await);
    for _ in 0..3 {
        fake = fake.with_destroy_error(VirtError::Transport("connection refused".into()));
    }
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(VmRegistry::new(dir.path()).unwrap());
    let manager = manager(fake, fast_settings()).with_registry(registry.clone());

    let (report, updates) = run_to_end(&manager, task()).await;

    assert!(matches!(report.cleanup, CleanupStatus::DestroyFailed(_)));
    assert_eq!(report.final_phase, VmPhase::Failed);
    assert_eq!(phases(&updates).last(), Some(&VmPhase::Failed));
    assert_eq!(manager.client().live(), vec![report.vm_id.unwrap()]);

    // the leaked VM stays on record for reconcile
    let records = registry.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].vm_id, report.vm_id.unwrap());
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconcile
// ─────────────────────────────────────────────────────────────────────────────

/// Orphaned agent VMs are destroyed; untagged VMs and live tasks are left alone
#[tokio::test]
async fn test_reconcile_destroys_orphans_only() {
    let fake = FakeVirtualization::new()
        .with_existing_vm(9001, "agent-old", &["codevisor", "task-old"])
        .with_existing_vm(9002, "build-runner", &["ci"]);
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(VmRegistry::new(dir.path()).unwrap());
    registry.save(&VmHandle::new("gone", 9100, "agent-gone")).unwrap();
    let manager = manager(fake, fast_settings()).with_registry(registry.clone());

    let report = manager.reconcile_orphans().await.unwrap();

    assert_eq!(report.destroyed, vec![9001]);
    assert!(report.failed.is_empty());
    assert_eq!(report.stale_records, 1);
    assert_eq!(manager.client().live(), vec![9002]);
    assert!(registry.list().unwrap().is_empty());
}

/// A leaked VM left by a failed teardown is picked up by the next reconcile
#[tokio::test]
async fn test_reconcile_after_destroy_failure() {
    let mut fake = FakeVirtualization::new().with_progress(&agent_log(succeeded()).await);
    for _ in 0..3 {
        fake = fake.with_destroy_error(VirtError::Timeout("destroy task".into()));
    }
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(VmRegistry::new(dir.path()).unwrap());
    let manager = manager(fake, fast_settings()).with_registry(registry.clone());

    let (report, _) = run_to_end(&manager, task()).await;
    let leaked = report.vm_id.unwrap();

    let reconciled = manager.reconcile_orphans().await.unwrap();
    assert_eq!(reconciled.destroyed, vec![leaked]);
    assert!(manager.client().live().is_empty());
    assert!(registry.list().unwrap().is_empty());
}

/// A second manager sharing the hypervisor and registry leaves a running task alone
#[tokio::test]
async fn test_reconcile_spares_other_managers_tasks() {
    let log = Arc::new(MemoryProgressLog::new());
    let mut writer = ProgressWriter::new(log.clone());
    writer.info("Cloning https://github.com/acme/app").await.unwrap();
    let fake = Arc::new(FakeVirtualization::new().with_progress(&log.events()));

    let dir = TempDir::new().unwrap();
    let registry = Arc::new(VmRegistry::new(dir.path()).unwrap());
    let gate = Arc::new(ProvisioningGate::new(4, 100, 1000.0));
    let first = Arc::new(
        VmLifecycleManager::new(fake.clone(), gate.clone(), fast_settings()).with_registry(registry.clone()),
    );
    let second = VmLifecycleManager::new(fake.clone(), gate, fast_settings()).with_registry(registry.clone());
    assert_ne!(first.owner_id(), second.owner_id());

    let (tx, mut rx) = mpsc::channel(256);
    let cancel = CancellationToken::new();
    let runner = {
        let first = first.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { first.run(task(), tx, cancel).await })
    };
    while let Some(update) = rx.recv().await {
        if matches!(update, TaskUpdate::Phase { phase: VmPhase::Polling, .. }) {
            break;
        }
    }

    let reconciled = second.reconcile_orphans().await.unwrap();
    assert!(reconciled.destroyed.is_empty(), "{reconciled:?}");
    assert_eq!(reconciled.skipped_owned, 1);
    assert_eq!(fake.live().len(), 1);
    assert_eq!(registry.list().unwrap().len(), 1);

    cancel.cancel();
    while rx.recv().await.is_some() {}
    let report = runner.await.unwrap().unwrap();
    assert_eq!(report.cleanup, CleanupStatus::Destroyed);
    assert!(fake.live().is_empty());
}

/// Records whose owner stopped reporting are reclaimed; fresh unrecorded clones are not
#[tokio::test]
async fn test_reconcile_reclaims_silent_owners_only() {
    let fresh_task = uuid::Uuid::now_v7().to_string();
    let fresh_tag = format!("task-{fresh_task}");
    let fake = FakeVirtualization::new()
        .with_existing_vm(9001, "agent-crashed", &["codevisor", "task-crashed"])
        .with_existing_vm(9002, "agent-cloning", &["codevisor", fresh_tag.as_str()]);
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(VmRegistry::new(dir.path()).unwrap());
    let mut crashed = VmHandle::new("crashed", 9001, "agent-crashed").with_owner("4242-gone");
    crashed.heartbeat_at = Some(chrono::Utc::now() - chrono::Duration::hours(1));
    registry.save(&crashed).unwrap();
    let manager = manager(fake, fast_settings()).with_registry(registry.clone());

    let report = manager.reconcile_orphans().await.unwrap();

    assert_eq!(report.destroyed, vec![9001]);
    assert_eq!(report.skipped_owned, 1);
    assert_eq!(manager.client().live(), vec![9002]);
    assert!(registry.list().unwrap().is_empty());
}

/// Sweeps a real cluster using settings from the environment
#[tokio::test]
#[ignore = "requires a reachable Proxmox API (PROXMOX_* environment)"]
async fn test_live_proxmox_reconcile() {
    let settings = codevisor::Settings::load(None).expect("settings from environment");
    let client = Arc::new(codevisor::ProxmoxClient::from_settings(&settings.proxmox).unwrap());
    let gate = Arc::new(ProvisioningGate::new(1, 1, 1.0));
    let manager = VmLifecycleManager::new(client, gate, LifecycleSettings::from_settings(&settings));

    let report = manager.reconcile_orphans().await.unwrap();
    assert!(report.failed.is_empty(), "{:?}", report.failed);
}
