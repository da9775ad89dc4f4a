//! Scoped ownership of one agent VM
//!
//! A [`VmLease`] is created the moment a clone returns a VMID. Releasing it
//! destroys the VM; dropping it unreleased (the run future was aborted)
//! destroys it from a background task. Either way the VM does not outlive
//! its task unless the hypervisor refuses to delete it, which is logged and
//! counted.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::backoff::Backoff;
use super::client::VirtualizationClient;
use super::handle::{VmHandle, VmPhase};
use super::registry::VmRegistry;
use crate::metrics::{ACTIVE_VMS, VM_DESTROYED_TOTAL, VM_DESTROY_FAILURES};

/// How the VM left the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupStatus {
    /// The run failed before any VM existed.
    NotProvisioned,
    Destroyed,
    /// Every destroy attempt failed; the VM is still running.
    DestroyFailed(String),
}

impl CleanupStatus {
    pub fn is_destroyed(&self) -> bool {
        matches!(self, CleanupStatus::Destroyed)
    }
}

/// Destroy retry schedule
#[derive(Debug, Clone, Copy)]
pub struct DestroyPolicy {
    pub backoff: Backoff,
}

impl Default for DestroyPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff {
                max_attempts: 3,
                base: Duration::from_secs(2),
                cap: Duration::from_secs(30),
            },
        }
    }
}

pub struct VmLease<C: VirtualizationClient + 'static> {
    client: Arc<C>,
    handle: VmHandle,
    registry: Option<Arc<VmRegistry>>,
    policy: DestroyPolicy,
    armed: bool,
}

impl<C: VirtualizationClient + 'static> VmLease<C> {
    pub fn new(
        client: Arc<C>,
        handle: VmHandle,
        registry: Option<Arc<VmRegistry>>,
        policy: DestroyPolicy,
    ) -> Self {
        ACTIVE_VMS.inc();
        let lease = Self {
            client,
            handle,
            registry,
            policy,
            armed: true,
        };
        lease.persist();
        lease
    }

    pub fn handle(&self) -> &VmHandle {
        &self.handle
    }

    pub fn vm_id(&self) -> u32 {
        self.handle.vm_id
    }

    pub fn set_phase(&mut self, phase: VmPhase) {
        self.handle.mark_phase(phase);
        self.handle.heartbeat();
        self.persist();
    }

    pub fn set_ip(&mut self, ip: &str) {
        self.handle.mark_ready(ip);
        self.persist();
    }

    /// Refresh the record so other managers see the task is still alive.
    pub fn heartbeat(&mut self) {
        if self.registry.is_some() {
            self.handle.heartbeat();
            self.persist();
        }
    }

    fn persist(&self) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.save(&self.handle) {
                warn!(task_id = %self.handle.task_id, error = %e, "Failed to persist VM record");
            }
        }
    }

    /// Destroy the VM. Disarms the drop guard only once destruction has run.
    pub async fn release(mut self) -> CleanupStatus {
        let status = destroy_with_retry(
            self.client.as_ref(),
            &self.handle,
            self.registry.as_deref(),
            &self.policy,
        )
        .await;
        if status.is_destroyed() {
            ACTIVE_VMS.dec();
        }
        self.armed = false;
        status
    }
}

impl<C: VirtualizationClient + 'static> Drop for VmLease<C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let client = self.client.clone();
        let handle = self.handle.clone();
        let registry = self.registry.clone();
        let policy = self.policy;
        warn!(vm_id = handle.vm_id, task_id = %handle.task_id, "VM lease dropped unreleased; destroying in background");

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let status = destroy_with_retry(client.as_ref(), &handle, registry.as_deref(), &policy).await;
                    if status.is_destroyed() {
                        ACTIVE_VMS.dec();
                    }
                });
            }
            Err(_) => {
                error!(
                    vm_id = handle.vm_id,
                    task_id = %handle.task_id,
                    "No runtime to destroy VM; it stays until the next reconcile"
                );
                VM_DESTROY_FAILURES.inc();
            }
        }
    }
}

/// Destroy `handle`'s VM with retries. A VM that is already gone counts as
/// destroyed. On success the registry record is removed; on failure it is
/// kept (marked failed) for the next reconcile.
pub async fn destroy_with_retry<C: VirtualizationClient + ?Sized>(
    client: &C,
    handle: &VmHandle,
    registry: Option<&VmRegistry>,
    policy: &DestroyPolicy,
) -> CleanupStatus {
    let attempts = policy.backoff.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match client.destroy(handle.vm_id).await {
            Ok(()) => {
                info!(vm_id = handle.vm_id, task_id = %handle.task_id, "VM destroyed");
                return finish_destroyed(handle, registry);
            }
            Err(e) if e.is_not_found() => {
                info!(vm_id = handle.vm_id, "VM already gone");
                return finish_destroyed(handle, registry);
            }
            Err(e) => {
                warn!(vm_id = handle.vm_id, attempt, error = %e, "VM destroy attempt failed");
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(policy.backoff.delay(attempt)).await;
                }
            }
        }
    }

    error!(
        vm_id = handle.vm_id,
        task_id = %handle.task_id,
        error = %last_error,
        "VM DESTRUCTION FAILED; VM leaked"
    );
    VM_DESTROY_FAILURES.inc();
    if let Some(registry) = registry {
        let mut record = handle.clone();
        record.mark_failed();
        if let Err(e) = registry.save(&record) {
            warn!(task_id = %handle.task_id, error = %e, "Failed to persist leaked VM record");
        }
    }
    CleanupStatus::DestroyFailed(last_error)
}

fn finish_destroyed(handle: &VmHandle, registry: Option<&VmRegistry>) -> CleanupStatus {
    VM_DESTROYED_TOTAL.inc();
    if let Some(registry) = registry {
        if let Err(e) = registry.remove(&handle.task_id) {
            warn!(task_id = %handle.task_id, error = %e, "Failed to remove VM record");
        }
    }
    CleanupStatus::Destroyed
}
