//! VM sizing and Proxmox API payloads
//!
//! The payload structs mirror the JSON bodies of the Proxmox VE API
//! (`/api2/json`). Responses are wrapped in a `{"data": ...}` envelope.

use serde::{Deserialize, Serialize};

/// Sizing presets for agent VMs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmSize {
    /// 1 core, 2 GiB
    Small,
    /// 2 cores, 4 GiB
    #[default]
    Medium,
    /// 4 cores, 8 GiB
    Large,
}

impl VmSize {
    pub fn cores(&self) -> u32 {
        match self {
            VmSize::Small => 1,
            VmSize::Medium => 2,
            VmSize::Large => 4,
        }
    }

    pub fn memory_mb(&self) -> u32 {
        match self {
            VmSize::Small => 2048,
            VmSize::Medium => 4096,
            VmSize::Large => 8192,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Some(VmSize::Small),
            "medium" => Some(VmSize::Medium),
            "large" => Some(VmSize::Large),
            _ => None,
        }
    }
}

/// `{"data": T}` wrapper around every API response
#[derive(Deserialize, Debug)]
pub struct ApiEnvelope<T> {
    pub data: T,
}

/// POST /access/ticket response
#[derive(Deserialize, Debug, Clone)]
pub struct TicketData {
    pub ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    pub csrf_token: String,
}

/// POST /nodes/{node}/qemu/{template}/clone
#[derive(Serialize, Debug, Clone)]
pub struct CloneRequest {
    pub newid: u32,
    pub name: String,
    pub full: u8,
    pub target: String,
}

/// PUT /nodes/{node}/qemu/{vmid}/config
#[derive(Serialize, Debug, Clone)]
pub struct VmConfigUpdate {
    pub cores: u32,
    pub memory: u32,
    /// Semicolon-separated tag list
    pub tags: String,
}

/// Entry of GET /cluster/resources?type=vm
#[derive(Deserialize, Debug, Clone)]
pub struct ClusterResource {
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub template: Option<u8>,
}

impl ClusterResource {
    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .unwrap_or_default()
            .split([';', ',', ' '])
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// GET /nodes/{node}/tasks/{upid}/status
#[derive(Deserialize, Debug, Clone)]
pub struct TaskStatus {
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

/// GET /nodes/{node}/qemu/{vmid}/status/current
#[derive(Deserialize, Debug, Clone)]
pub struct CurrentStatus {
    pub status: String,
}

/// GET /nodes/{node}/qemu/{vmid}/agent/network-get-interfaces
#[derive(Deserialize, Debug, Clone)]
pub struct NetworkInterfaces {
    #[serde(default)]
    pub result: Vec<NetworkInterface>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    #[serde(default, rename = "ip-addresses")]
    pub ip_addresses: Vec<IpAddress>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct IpAddress {
    #[serde(rename = "ip-address-type")]
    pub address_type: String,
    #[serde(rename = "ip-address")]
    pub address: String,
}

impl NetworkInterfaces {
    /// First IPv4 address that is not on a loopback interface.
    pub fn first_ipv4(&self) -> Option<String> {
        self.result
            .iter()
            .filter(|iface| iface.name != "lo" && iface.name != "localhost")
            .flat_map(|iface| iface.ip_addresses.iter())
            .find(|ip| ip.address_type == "ipv4" && !ip.address.starts_with("127."))
            .map(|ip| ip.address.clone())
    }
}

/// POST /nodes/{node}/qemu/{vmid}/agent/exec
#[derive(Serialize, Debug, Clone)]
pub struct GuestExecRequest {
    pub command: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct GuestExecStarted {
    pub pid: u64,
}

/// GET /nodes/{node}/qemu/{vmid}/agent/exec-status
#[derive(Deserialize, Debug, Clone)]
pub struct GuestExecStatus {
    #[serde(default)]
    pub exited: u8,
    #[serde(default)]
    pub exitcode: Option<i32>,
    #[serde(default, rename = "out-data")]
    pub out_data: Option<String>,
    #[serde(default, rename = "err-data")]
    pub err_data: Option<String>,
}

/// POST /nodes/{node}/qemu/{vmid}/agent/file-write
#[derive(Serialize, Debug, Clone)]
pub struct FileWriteRequest {
    pub file: String,
    pub content: String,
}
