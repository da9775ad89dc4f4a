//! Virtualization control abstraction
//!
//! The lifecycle manager only talks to the hypervisor through
//! [`VirtualizationClient`], so tests can drive it with an in-memory fake
//! and production uses the Proxmox backend.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Tag carried by every VM this crate creates.
pub const AGENT_TAG: &str = "codevisor";

/// What to clone from the template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub cores: u32,
    pub memory_mb: u32,
    pub tags: Vec<String>,
}

impl VmSpec {
    pub fn for_task(task_id: &str, short_id: &str, cores: u32, memory_mb: u32) -> Self {
        Self {
            name: format!("agent-{short_id}"),
            cores,
            memory_mb,
            tags: vec![AGENT_TAG.to_string(), task_tag(task_id)],
        }
    }
}

/// `task-<id>` tag used to find a task's VM after a restart.
pub fn task_tag(task_id: &str) -> String {
    format!("task-{task_id}")
}

/// Reachability snapshot of one VM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmStatus {
    pub running: bool,
    /// Guest agent answered a ping.
    pub agent_ready: bool,
    /// First non-loopback IPv4 reported by the guest agent.
    pub ip_address: Option<String>,
}

impl VmStatus {
    pub fn is_reachable(&self) -> bool {
        self.running && self.agent_ready && self.ip_address.is_some()
    }
}

/// Result of a command run through the guest agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestExecResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GuestExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A VM found by tag during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedVm {
    pub vm_id: u32,
    pub name: String,
    pub tags: Vec<String>,
}

impl TaggedVm {
    /// Task id recovered from the `task-<id>` tag.
    pub fn task_id(&self) -> Option<&str> {
        self.tags.iter().find_map(|t| t.strip_prefix("task-"))
    }
}

#[derive(Debug, Error)]
pub enum VirtError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("VM {0} does not exist")]
    NotFound(u32),

    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("hypervisor task {upid} failed: {exit_status}")]
    TaskFailed { upid: String, exit_status: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("guest agent error: {0}")]
    Guest(String),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

impl VirtError {
    /// Transient failures worth another attempt. Credentials, missing
    /// templates and other 4xx answers are configuration problems.
    pub fn is_retryable(&self) -> bool {
        match self {
            VirtError::Transport(_) | VirtError::Timeout(_) | VirtError::TaskFailed { .. } => true,
            VirtError::Api { status, .. } => *status >= 500 || *status == 429,
            VirtError::Auth(_)
            | VirtError::NotFound(_)
            | VirtError::Guest(_)
            | VirtError::InvalidResponse(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VirtError::NotFound(_))
    }
}

impl From<reqwest::Error> for VirtError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            VirtError::Timeout(e.to_string())
        } else if e.is_decode() {
            VirtError::InvalidResponse(e.to_string())
        } else {
            VirtError::Transport(e.to_string())
        }
    }
}

/// Hypervisor operations the lifecycle manager needs.
#[async_trait]
pub trait VirtualizationClient: Send + Sync {
    /// Clone the template into a new, configured but stopped VM.
    async fn clone_template(&self, spec: &VmSpec) -> Result<u32, VirtError>;

    async fn start(&self, vm_id: u32) -> Result<(), VirtError>;

    async fn status(&self, vm_id: u32) -> Result<VmStatus, VirtError>;

    /// Run `command` through `sh -c` in the guest and wait for it to exit.
    async fn exec(&self, vm_id: u32, command: &str, timeout: Duration) -> Result<GuestExecResult, VirtError>;

    async fn write_file(&self, vm_id: u32, path: &str, content: &str) -> Result<(), VirtError>;

    /// Stop and delete the VM with its disks. A VM that no longer exists
    /// yields [`VirtError::NotFound`].
    async fn destroy(&self, vm_id: u32) -> Result<(), VirtError>;

    async fn list_tagged(&self, tag: &str) -> Result<Vec<TaggedVm>, VirtError>;
}

#[async_trait]
impl<T: VirtualizationClient + ?Sized> VirtualizationClient for std::sync::Arc<T> {
    async fn clone_template(&self, spec: &VmSpec) -> Result<u32, VirtError> {
        (**self).clone_template(spec).await
    }

    async fn start(&self, vm_id: u32) -> Result<(), VirtError> {
        (**self).start(vm_id).await
    }

    async fn status(&self, vm_id: u32) -> Result<VmStatus, VirtError> {
        (**self).status(vm_id).await
    }

    async fn exec(&self, vm_id: u32, command: &str, timeout: Duration) -> Result<GuestExecResult, VirtError> {
        (**self).exec(vm_id, command, timeout).await
    }

    async fn write_file(&self, vm_id: u32, path: &str, content: &str) -> Result<(), VirtError> {
        (**self).write_file(vm_id, path, content).await
    }

    async fn destroy(&self, vm_id: u32) -> Result<(), VirtError> {
        (**self).destroy(vm_id).await
    }

    async fn list_tagged(&self, tag: &str) -> Result<Vec<TaggedVm>, VirtError> {
        (**self).list_tagged(tag).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(VirtError::Transport("reset".into()).is_retryable());
        assert!(VirtError::Api { status: 503, body: String::new() }.is_retryable());
        assert!(VirtError::Api { status: 429, body: String::new() }.is_retryable());
        assert!(!VirtError::Api { status: 400, body: String::new() }.is_retryable());
        assert!(!VirtError::Auth("bad token".into()).is_retryable());
        assert!(!VirtError::NotFound(9000).is_retryable());
    }

    #[test]
    fn test_spec_tags_and_task_lookup() {
        let spec = VmSpec::for_task("0192-abc", "abc", 2, 4096);
        assert_eq!(spec.name, "agent-abc");
        assert_eq!(spec.tags, vec!["codevisor".to_string(), "task-0192-abc".to_string()]);

        let vm = TaggedVm {
            vm_id: 10001,
            name: spec.name.clone(),
            tags: spec.tags.clone(),
        };
        assert_eq!(vm.task_id(), Some("0192-abc"));
    }
}
