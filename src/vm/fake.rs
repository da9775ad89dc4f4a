//! In-memory hypervisor for tests.
//!
//! VMs are plain records. The guest progress log is a scripted list of
//! events revealed a few lines per read, so pollers see it grow the way a
//! real agent's log does.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::client::{GuestExecResult, TaggedVm, VirtError, VirtualizationClient, VmSpec, VmStatus};
use crate::progress::ProgressEvent;

struct FakeVm {
    name: String,
    tags: Vec<String>,
    running: bool,
    status_polls: usize,
    files: BTreeMap<String, String>,
    commands: Vec<String>,
    revealed: usize,
}

struct FakeState {
    next_vmid: u32,
    vms: BTreeMap<u32, FakeVm>,
    clone_errors: VecDeque<VirtError>,
    destroy_errors: VecDeque<VirtError>,
    ready_after: usize,
    progress: Vec<String>,
    reveal_per_read: usize,
    panic_on_write: bool,
    clone_delay: Duration,
    created: Vec<u32>,
    destroyed: Vec<u32>,
}

/// Scriptable [`VirtualizationClient`]
pub struct FakeVirtualization {
    state: Mutex<FakeState>,
}

impl Default for FakeVirtualization {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeVirtualization {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_vmid: 10000,
                vms: BTreeMap::new(),
                clone_errors: VecDeque::new(),
                destroy_errors: VecDeque::new(),
                ready_after: 0,
                progress: Vec::new(),
                reveal_per_read: 2,
                panic_on_write: false,
                clone_delay: Duration::ZERO,
                created: Vec::new(),
                destroyed: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next clone with `error` (queued, one per call).
    pub fn with_clone_error(self, error: VirtError) -> Self {
        self.lock().clone_errors.push_back(error);
        self
    }

    /// Clones allocate their VMID at once but return only after `delay`,
    /// like a full clone waiting on its hypervisor task.
    pub fn with_clone_delay(self, delay: Duration) -> Self {
        self.lock().clone_delay = delay;
        self
    }

    pub fn with_destroy_error(self, error: VirtError) -> Self {
        self.lock().destroy_errors.push_back(error);
        self
    }

    /// Report unreachable for the first `polls` status calls.
    pub fn with_ready_after(self, polls: usize) -> Self {
        self.lock().ready_after = polls;
        self
    }

    pub fn never_ready(self) -> Self {
        self.with_ready_after(usize::MAX)
    }

    /// Events the "agent" writes to its progress log.
    pub fn with_progress(self, events: &[ProgressEvent]) -> Self {
        let lines = events
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect();
        self.lock().progress = lines;
        self
    }

    pub fn with_reveal_per_read(self, lines: usize) -> Self {
        self.lock().reveal_per_read = lines.max(1);
        self
    }

    /// Panic inside `write_file`, i.e. during config injection.
    pub fn with_panic_on_write(self) -> Self {
        self.lock().panic_on_write = true;
        self
    }

    /// A VM left over from an earlier process.
    pub fn with_existing_vm(self, vm_id: u32, name: &str, tags: &[&str]) -> Self {
        self.lock().vms.insert(
            vm_id,
            FakeVm {
                name: name.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                running: true,
                status_polls: 0,
                files: BTreeMap::new(),
                commands: Vec::new(),
                revealed: 0,
            },
        );
        self
    }

    pub fn created(&self) -> Vec<u32> {
        self.lock().created.clone()
    }

    pub fn destroyed(&self) -> Vec<u32> {
        self.lock().destroyed.clone()
    }

    /// VMs that exist right now.
    pub fn live(&self) -> Vec<u32> {
        self.lock().vms.keys().copied().collect()
    }

    pub fn files(&self, vm_id: u32) -> BTreeMap<String, String> {
        self.lock()
            .vms
            .get(&vm_id)
            .map(|vm| vm.files.clone())
            .unwrap_or_default()
    }

    /// Non-progress commands run in the guest.
    pub fn commands(&self, vm_id: u32) -> Vec<String> {
        self.lock()
            .vms
            .get(&vm_id)
            .map(|vm| vm.commands.clone())
            .unwrap_or_default()
    }

    fn register_clone(&self, spec: &VmSpec) -> Result<(u32, Duration), VirtError> {
        let mut state = self.lock();
        if let Some(error) = state.clone_errors.pop_front() {
            return Err(error);
        }
        let vm_id = state.next_vmid;
        state.next_vmid += 1;
        state.vms.insert(
            vm_id,
            FakeVm {
                name: spec.name.clone(),
                tags: spec.tags.clone(),
                running: false,
                status_polls: 0,
                files: BTreeMap::new(),
                commands: Vec::new(),
                revealed: 0,
            },
        );
        state.created.push(vm_id);
        Ok((vm_id, state.clone_delay))
    }
}

fn tail_offset(command: &str) -> Option<usize> {
    let rest = command.strip_prefix("tail -n +")?;
    rest.split_whitespace().next()?.parse().ok()
}

#[async_trait]
impl VirtualizationClient for FakeVirtualization {
    async fn clone_template(&self, spec: &VmSpec) -> Result<u32, VirtError> {
        let (vm_id, delay) = self.register_clone(spec)?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(vm_id)
    }

    async fn start(&self, vm_id: u32) -> Result<(), VirtError> {
        let mut state = self.lock();
        let vm = state.vms.get_mut(&vm_id).ok_or(VirtError::NotFound(vm_id))?;
        vm.running = true;
        Ok(())
    }

    async fn status(&self, vm_id: u32) -> Result<VmStatus, VirtError> {
        let mut state = self.lock();
        let ready_after = state.ready_after;
        let vm = state.vms.get_mut(&vm_id).ok_or(VirtError::NotFound(vm_id))?;
        if !vm.running {
            return Ok(VmStatus::default());
        }
        vm.status_polls += 1;
        let reachable = vm.status_polls > ready_after;
        Ok(VmStatus {
            running: true,
            agent_ready: reachable,
            ip_address: reachable.then(|| format!("10.0.{}.{}", vm_id / 250 % 250, vm_id % 250)),
        })
    }

    async fn exec(&self, vm_id: u32, command: &str, _timeout: Duration) -> Result<GuestExecResult, VirtError> {
        let mut state = self.lock();
        let per_read = state.reveal_per_read;
        let total = state.progress.len();
        let vm = state.vms.get_mut(&vm_id).ok_or(VirtError::NotFound(vm_id))?;
        if !vm.running {
            return Err(VirtError::Guest("guest agent is not running".to_string()));
        }

        let Some(start) = tail_offset(command) else {
            vm.commands.push(command.to_string());
            return Ok(GuestExecResult {
                exit_code: Some(0),
                ..GuestExecResult::default()
            });
        };

        vm.revealed = (vm.revealed + per_read).min(total);
        let revealed = vm.revealed;
        let from = start.saturating_sub(1).min(revealed);
        let mut stdout = state.progress[from..revealed].join("\n");
        if !stdout.is_empty() {
            stdout.push('\n');
        }
        Ok(GuestExecResult {
            exit_code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }

    async fn write_file(&self, vm_id: u32, path: &str, content: &str) -> Result<(), VirtError> {
        let mut state = self.lock();
        if state.panic_on_write {
            drop(state);
            panic!("injected failure while writing {path}");
        }
        let vm = state.vms.get_mut(&vm_id).ok_or(VirtError::NotFound(vm_id))?;
        vm.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn destroy(&self, vm_id: u32) -> Result<(), VirtError> {
        let mut state = self.lock();
        if let Some(error) = state.destroy_errors.pop_front() {
            return Err(error);
        }
        if state.vms.remove(&vm_id).is_none() {
            return Err(VirtError::NotFound(vm_id));
        }
        state.destroyed.push(vm_id);
        Ok(())
    }

    async fn list_tagged(&self, tag: &str) -> Result<Vec<TaggedVm>, VirtError> {
        let state = self.lock();
        Ok(state
            .vms
            .iter()
            .filter(|(_, vm)| vm.tags.iter().any(|t| t == tag))
            .map(|(vm_id, vm)| TaggedVm {
                vm_id: *vm_id,
                name: vm.name.clone(),
                tags: vm.tags.clone(),
            })
            .collect())
    }
}
