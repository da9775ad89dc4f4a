//! Agent VM management
//!
//! This module provides everything between a task and a disposable VM:
//! - Hypervisor abstraction ([`VirtualizationClient`]) and its Proxmox VE client
//! - API payloads and VM sizing
//! - Provisioning gate (concurrency + request rate)
//! - Lifecycle state machine with guaranteed teardown
//! - On-disk VM registry for crash recovery

pub mod backoff;
pub mod client;
pub mod config;
pub mod fake;
pub mod gate;
pub mod guest;
pub mod handle;
pub mod lease;
pub mod lifecycle;
pub mod proxmox;
pub mod registry;

pub use backoff::Backoff;
pub use client::{
    task_tag, GuestExecResult, TaggedVm, VirtError, VirtualizationClient, VmSpec, VmStatus,
    AGENT_TAG,
};
pub use config::VmSize;
pub use fake::FakeVirtualization;
pub use gate::{ProvisioningGate, RateLimiter};
pub use guest::GuestProgressReader;
pub use handle::{VmHandle, VmPhase};
pub use lease::{CleanupStatus, DestroyPolicy, VmLease};
pub use lifecycle::{
    LifecycleError, LifecycleSettings, ReconcileReport, TaskReport, TaskUpdate,
    VmLifecycleManager, TASK_CONFIG_PATH,
};
pub use proxmox::ProxmoxClient;
pub use registry::VmRegistry;
