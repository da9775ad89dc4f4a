//! Orchestrator settings
//!
//! Loaded once at startup: an optional TOML file, then environment
//! overrides, then [`Settings::validate`]. Nothing touches the hypervisor
//! before validation has passed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::vm::VmSize;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable {key}={value:?} is invalid: {reason}")]
    Env {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Proxmox connection and cloning parameters
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxmoxSettings {
    /// `host:port`, or a full `https://` URL
    pub host: String,
    pub user: String,
    pub password: String,
    /// Full token id (`user@realm!name`); takes precedence over the password
    pub token_id: Option<String>,
    pub token_secret: Option<String>,
    pub node: String,
    pub verify_ssl: bool,
    pub template_vmid: u32,
    /// First VMID handed out to agent VMs
    pub vm_pool_start: u32,
    pub request_timeout_secs: u64,
    /// Upper bound for clone/start/stop/delete tasks
    pub task_timeout_secs: u64,
}

impl Default for ProxmoxSettings {
    fn default() -> Self {
        Self {
            host: "proxmox.local:8006".to_string(),
            user: "root@pam".to_string(),
            password: String::new(),
            token_id: None,
            token_secret: None,
            node: "pve".to_string(),
            verify_ssl: false,
            template_vmid: 9000,
            vm_pool_start: 10000,
            request_timeout_secs: 30,
            task_timeout_secs: 300,
        }
    }
}

impl ProxmoxSettings {
    pub fn uses_token(&self) -> bool {
        self.token_id.as_deref().is_some_and(|t| !t.is_empty())
            && self.token_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

impl std::fmt::Debug for ProxmoxSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxmoxSettings")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("token_id", &self.token_id)
            .field("token_secret", &self.token_secret.as_ref().map(|_| "<redacted>"))
            .field("node", &self.node)
            .field("verify_ssl", &self.verify_ssl)
            .field("template_vmid", &self.template_vmid)
            .field("vm_pool_start", &self.vm_pool_start)
            .finish()
    }
}

/// Agent VM sizing and lifecycle timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSettings {
    pub size: VmSize,
    /// Overrides the preset's core count
    pub cores: Option<u32>,
    /// Overrides the preset's memory (MiB)
    pub memory_mb: Option<u32>,
    pub readiness_timeout_secs: u64,
    pub liveness_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// How long a VM record stays with a manager that stopped reporting
    pub orphan_grace_secs: u64,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            size: VmSize::Medium,
            cores: None,
            memory_mb: None,
            readiness_timeout_secs: 180,
            liveness_timeout_secs: 300,
            poll_interval_secs: 3,
            orphan_grace_secs: 900,
        }
    }
}

impl VmSettings {
    pub fn cores(&self) -> u32 {
        self.cores.unwrap_or_else(|| self.size.cores())
    }

    pub fn memory_mb(&self) -> u32 {
        self.memory_mb.unwrap_or_else(|| self.size.memory_mb())
    }
}

/// LLM endpoint handed to every agent
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub api_url: String,
    pub api_key: String,
    /// Used when the caller does not name a model
    pub default_model: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_url: "http://open-webui:8080/api".to_string(),
            api_key: String::new(),
            default_model: "qwen2.5-coder:14b".to_string(),
        }
    }
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("api_url", &self.api_url)
            .field("api_key", &"<redacted>")
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// Everything the orchestrator needs from its environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub proxmox: ProxmoxSettings,
    pub vm: VmSettings,
    pub llm: LlmSettings,
    pub max_task_duration_secs: u64,
    pub max_concurrent_provisions: usize,
    /// Sustained rate of provisioning calls against the hypervisor
    pub provisions_per_second: f64,
    /// Persisted VM records for crash recovery
    pub state_dir: PathBuf,
    pub otlp_endpoint: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            proxmox: ProxmoxSettings::default(),
            vm: VmSettings::default(),
            llm: LlmSettings::default(),
            max_task_duration_secs: 3600,
            max_concurrent_provisions: 4,
            provisions_per_second: 0.5,
            state_dir: PathBuf::from("/var/lib/codevisor"),
            otlp_endpoint: None,
        }
    }
}

impl Settings {
    /// File (if any), then the process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env_from(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = toml::from_str(&text)?;
        debug!(path = %path.display(), "loaded settings file");
        Ok(settings)
    }

    /// Apply overrides from `lookup` (the environment in production).
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("PROXMOX_HOST") {
            self.proxmox.host = v;
        }
        if let Some(v) = get("PROXMOX_USER") {
            self.proxmox.user = v;
        }
        if let Some(v) = get("PROXMOX_PASSWORD") {
            self.proxmox.password = v;
        }
        if let Some(v) = get("PROXMOX_TOKEN_ID") {
            self.proxmox.token_id = Some(v);
        }
        if let Some(v) = get("PROXMOX_TOKEN_SECRET") {
            self.proxmox.token_secret = Some(v);
        }
        if let Some(v) = get("PROXMOX_NODE") {
            self.proxmox.node = v;
        }
        if let Some(v) = get("PROXMOX_VERIFY_SSL") {
            self.proxmox.verify_ssl = parse_bool("PROXMOX_VERIFY_SSL", &v)?;
        }
        if let Some(v) = get("AGENT_TEMPLATE_VMID") {
            self.proxmox.template_vmid = parse_num("AGENT_TEMPLATE_VMID", &v)?;
        }
        if let Some(v) = get("VM_POOL_START") {
            self.proxmox.vm_pool_start = parse_num("VM_POOL_START", &v)?;
        }
        if let Some(v) = get("VM_SIZE") {
            self.vm.size = VmSize::parse(&v).ok_or_else(|| ConfigError::Env {
                key: "VM_SIZE".to_string(),
                value: v.clone(),
                reason: "expected small, medium or large".to_string(),
            })?;
        }
        if let Some(v) = get("VM_CORES") {
            self.vm.cores = Some(parse_num("VM_CORES", &v)?);
        }
        if let Some(v) = get("VM_MEMORY") {
            self.vm.memory_mb = Some(parse_num("VM_MEMORY", &v)?);
        }
        if let Some(v) = get("ORPHAN_GRACE_SECS") {
            self.vm.orphan_grace_secs = parse_num("ORPHAN_GRACE_SECS", &v)?;
        }
        if let Some(v) = get("MAX_TASK_DURATION") {
            self.max_task_duration_secs = parse_num("MAX_TASK_DURATION", &v)?;
        }
        if let Some(v) = get("MAX_CONCURRENT_PROVISIONS") {
            self.max_concurrent_provisions = parse_num("MAX_CONCURRENT_PROVISIONS", &v)?;
        }
        if let Some(v) = get("LLM_API_URL").or_else(|| get("OPENWEBUI_API_URL")) {
            self.llm.api_url = v;
        }
        if let Some(v) = get("LLM_API_KEY").or_else(|| get("OPENWEBUI_API_KEY")) {
            self.llm.api_key = v;
        }
        if let Some(v) = get("DEFAULT_MODEL") {
            self.llm.default_model = v;
        }
        if let Some(v) = get("CODEVISOR_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = get("OTLP_ENDPOINT") {
            self.otlp_endpoint = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.proxmox.host.trim().is_empty() {
            return invalid("proxmox host must be set (PROXMOX_HOST)");
        }
        if self.proxmox.node.trim().is_empty() {
            return invalid("proxmox node must be set (PROXMOX_NODE)");
        }
        let has_password = !self.proxmox.user.is_empty() && !self.proxmox.password.is_empty();
        if !self.proxmox.uses_token() && !has_password {
            return invalid(
                "proxmox credentials missing: set PROXMOX_TOKEN_ID and PROXMOX_TOKEN_SECRET, \
                 or PROXMOX_USER and PROXMOX_PASSWORD",
            );
        }
        if self.proxmox.template_vmid < 100 {
            return invalid("template VMID must be 100 or greater");
        }
        if self.proxmox.vm_pool_start <= self.proxmox.template_vmid {
            return invalid("VM pool start must be above the template VMID");
        }
        if !(1..=128).contains(&self.vm.cores()) {
            return invalid("VM cores must be between 1 and 128");
        }
        if self.vm.memory_mb() < 512 {
            return invalid("VM memory must be at least 512 MiB");
        }
        if self.max_task_duration_secs == 0 {
            return invalid("max task duration must be greater than zero");
        }
        if self.max_concurrent_provisions == 0 {
            return invalid("max concurrent provisions must be at least 1");
        }
        if self.provisions_per_second.is_nan() || self.provisions_per_second <= 0.0 {
            return invalid("provisions per second must be positive");
        }
        if !(self.llm.api_url.starts_with("http://") || self.llm.api_url.starts_with("https://")) {
            return invalid("LLM API URL must start with http:// or https://");
        }
        if self.vm.poll_interval_secs == 0 || self.vm.readiness_timeout_secs == 0 {
            return invalid("VM poll interval and readiness timeout must be greater than zero");
        }
        Ok(())
    }

    pub fn max_task_duration(&self) -> Duration {
        Duration::from_secs(self.max_task_duration_secs)
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.state_dir.join("vms")
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}
