//! VM Handle - one provisioned agent VM and where it is in its lifecycle
//!
//! Requested -> Provisioning -> WaitingReady -> ConfigInjected -> Running
//! -> Polling -> Cleanup -> Destroyed, with Failed reachable from every
//! non-terminal phase. Cleanup always follows Failed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a task's VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmPhase {
    Requested,
    Provisioning,
    WaitingReady,
    ConfigInjected,
    Running,
    Polling,
    Cleanup,
    Destroyed,
    Failed,
}

impl VmPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmPhase::Requested => "requested",
            VmPhase::Provisioning => "provisioning",
            VmPhase::WaitingReady => "waiting_ready",
            VmPhase::ConfigInjected => "config_injected",
            VmPhase::Running => "running",
            VmPhase::Polling => "polling",
            VmPhase::Cleanup => "cleanup",
            VmPhase::Destroyed => "destroyed",
            VmPhase::Failed => "failed",
        }
    }

    /// Human-readable line for chat rendering.
    pub fn describe(&self) -> &'static str {
        match self {
            VmPhase::Requested => "Task accepted",
            VmPhase::Provisioning => "Provisioning agent VM from template",
            VmPhase::WaitingReady => "Waiting for the VM to become reachable",
            VmPhase::ConfigInjected => "Task configuration delivered",
            VmPhase::Running => "Agent started",
            VmPhase::Polling => "Following agent progress",
            VmPhase::Cleanup => "Cleaning up",
            VmPhase::Destroyed => "VM destroyed",
            VmPhase::Failed => "Run failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VmPhase::Destroyed)
    }
}

impl std::fmt::Display for VmPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provisioned agent VM. Also the record persisted for crash recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmHandle {
    pub task_id: String,
    /// Hypervisor VMID
    pub vm_id: u32,
    /// e.g. "agent-3f9a1c2b7d4e"
    pub name: String,
    pub ip_address: Option<String>,
    pub phase: VmPhase,
    pub created_at: DateTime<Utc>,
    /// Manager instance that owns the VM while its task runs
    #[serde(default)]
    pub owner: Option<String>,
    /// Last time the owner reported the task alive
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl VmHandle {
    pub fn new(task_id: impl Into<String>, vm_id: u32, name: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            vm_id,
            name: name.into(),
            ip_address: None,
            phase: VmPhase::Provisioning,
            created_at: Utc::now(),
            owner: None,
            heartbeat_at: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self.heartbeat_at = Some(Utc::now());
        self
    }

    pub fn heartbeat(&mut self) {
        self.heartbeat_at = Some(Utc::now());
    }

    /// Owned by a manager other than `me` that reported in within `grace`.
    pub fn held_by_other(&self, me: &str, grace: Duration) -> bool {
        let Some(owner) = self.owner.as_deref() else {
            return false;
        };
        if owner == me {
            return false;
        }
        let last_seen = self.heartbeat_at.unwrap_or(self.created_at);
        match chrono::Duration::from_std(grace) {
            Ok(grace) => Utc::now() - last_seen < grace,
            Err(_) => true,
        }
    }

    /// Mark VM as reachable at `ip`
    pub fn mark_ready(&mut self, ip: impl Into<String>) {
        self.ip_address = Some(ip.into());
    }

    pub fn mark_phase(&mut self, phase: VmPhase) {
        self.phase = phase;
    }

    pub fn mark_failed(&mut self) {
        self.phase = VmPhase::Failed;
    }

    /// Time since the VM was cloned
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_transitions() {
        let mut handle = VmHandle::new("task-1", 10001, "agent-1");
        assert_eq!(handle.phase, VmPhase::Provisioning);
        handle.mark_ready("10.0.0.9");
        handle.mark_phase(VmPhase::Polling);
        assert_eq!(handle.ip_address.as_deref(), Some("10.0.0.9"));
        handle.mark_failed();
        assert_eq!(handle.phase, VmPhase::Failed);
        assert!(!handle.phase.is_terminal());
        assert!(VmPhase::Destroyed.is_terminal());
    }

    #[test]
    fn test_ownership_expires_without_heartbeat() {
        let grace = Duration::from_secs(600);
        let unowned = VmHandle::new("t", 10001, "agent-t");
        assert!(!unowned.held_by_other("me", grace));

        let mut theirs = VmHandle::new("t", 10001, "agent-t").with_owner("other");
        assert!(theirs.held_by_other("me", grace));
        assert!(!theirs.held_by_other("other", grace));

        theirs.heartbeat_at = Some(Utc::now() - chrono::Duration::minutes(11));
        assert!(!theirs.held_by_other("me", grace));
    }

    #[test]
    fn test_records_without_owner_still_load() {
        let json = r#"{"task_id":"t","vm_id":9100,"name":"agent-t","ip_address":null,
            "phase":"polling","created_at":"2026-01-01T00:00:00Z"}"#;
        let handle: VmHandle = serde_json::from_str(json).unwrap();
        assert_eq!(handle.owner, None);
        assert_eq!(handle.heartbeat_at, None);
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_string(&VmPhase::WaitingReady).unwrap();
        assert_eq!(json, "\"waiting_ready\"");
        assert_eq!(VmPhase::ConfigInjected.to_string(), "config_injected");
    }
}
