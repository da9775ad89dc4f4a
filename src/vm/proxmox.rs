//! Proxmox VE backend
//!
//! Talks to the `/api2/json` REST API over reqwest. Long-running operations
//! (clone, start, stop, delete) return a UPID that is polled until the task
//! stops. Guest interaction goes through the QEMU guest agent endpoints.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::client::{GuestExecResult, TaggedVm, VirtError, VirtualizationClient, VmSpec, VmStatus};
use super::config::*;
use crate::config::ProxmoxSettings;

/// Tickets are valid for two hours; renew well before that.
const TICKET_LIFETIME: Duration = Duration::from_secs(90 * 60);

enum Auth {
    /// Pre-rendered `PVEAPIToken=...` header value
    Token(String),
    Password { user: String, password: String },
}

struct Ticket {
    cookie: String,
    csrf_token: String,
    issued: Instant,
}

/// Client for one Proxmox node
pub struct ProxmoxClient {
    http: reqwest::Client,
    base_url: String,
    node: String,
    template_vmid: u32,
    vm_pool_start: u32,
    auth: Auth,
    ticket: Mutex<Option<Ticket>>,
    /// VMIDs handed out but not yet visible in the cluster listing
    reserved: Mutex<HashSet<u32>>,
    task_timeout: Duration,
    task_poll_interval: Duration,
    exec_poll_interval: Duration,
}

impl ProxmoxClient {
    pub fn from_settings(settings: &ProxmoxSettings) -> Result<Self, VirtError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!settings.verify_ssl)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;

        let auth = match (&settings.token_id, &settings.token_secret) {
            (Some(id), Some(secret)) if settings.uses_token() => {
                Auth::Token(format!("PVEAPIToken={id}={secret}"))
            }
            _ => Auth::Password {
                user: settings.user.clone(),
                password: settings.password.clone(),
            },
        };

        Ok(Self {
            http,
            base_url: api_base_url(&settings.host),
            node: settings.node.clone(),
            template_vmid: settings.template_vmid,
            vm_pool_start: settings.vm_pool_start,
            auth,
            ticket: Mutex::new(None),
            reserved: Mutex::new(HashSet::new()),
            task_timeout: Duration::from_secs(settings.task_timeout_secs),
            task_poll_interval: Duration::from_secs(2),
            exec_poll_interval: Duration::from_millis(500),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn qemu_path(&self, vm_id: u32, suffix: &str) -> String {
        format!("/nodes/{}/qemu/{}{}", self.node, vm_id, suffix)
    }

    /// Send a request and unwrap the `data` envelope.
    async fn send<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        vm_id: Option<u32>,
    ) -> Result<T, VirtError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method.clone(), &url);
        request = self.authorize(request, &method).await?;
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(%method, path, status = status.as_u16(), "Proxmox API error");
            return Err(classify_error(status.as_u16(), body, vm_id));
        }

        let envelope: ApiEnvelope<T> = response.json().await?;
        Ok(envelope.data)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, vm_id: Option<u32>) -> Result<T, VirtError> {
        self.send::<T, ()>(Method::GET, path, None, vm_id).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
        vm_id: Option<u32>,
    ) -> Result<T, VirtError> {
        self.send(Method::POST, path, body, vm_id).await
    }

    async fn authorize(
        &self,
        request: reqwest::RequestBuilder,
        method: &Method,
    ) -> Result<reqwest::RequestBuilder, VirtError> {
        match &self.auth {
            Auth::Token(header) => Ok(request.header("Authorization", header.as_str())),
            Auth::Password { user, password } => {
                let mut ticket = self.ticket.lock().await;
                let stale = ticket
                    .as_ref()
                    .map(|t| t.issued.elapsed() >= TICKET_LIFETIME)
                    .unwrap_or(true);
                if stale {
                    *ticket = Some(self.login(user, password).await?);
                }
                let Some(t) = ticket.as_ref() else {
                    return Err(VirtError::Auth("no ticket".to_string()));
                };
                let mut request = request.header("Cookie", format!("PVEAuthCookie={}", t.cookie));
                if *method != Method::GET {
                    request = request.header("CSRFPreventionToken", t.csrf_token.as_str());
                }
                Ok(request)
            }
        }
    }

    async fn login(&self, user: &str, password: &str) -> Result<Ticket, VirtError> {
        let url = format!("{}/access/ticket", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "username": user, "password": password }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => VirtError::Auth(format!("login as {user} rejected")),
                code => classify_error(code, body, None),
            });
        }
        let envelope: ApiEnvelope<TicketData> = response.json().await?;
        info!(user, "Obtained Proxmox ticket");
        Ok(Ticket {
            cookie: envelope.data.ticket,
            csrf_token: envelope.data.csrf_token,
            issued: Instant::now(),
        })
    }

    /// Poll a UPID until the task stops.
    async fn wait_for_task(&self, upid: &str) -> Result<(), VirtError> {
        let started = Instant::now();
        let path = format!("/nodes/{}/tasks/{}/status", self.node, upid);
        loop {
            let status: TaskStatus = self.get(&path, None).await?;
            if status.status == "stopped" {
                let exit = status.exitstatus.unwrap_or_else(|| "unknown".to_string());
                if exit == "OK" || exit.starts_with("WARNINGS") {
                    return Ok(());
                }
                return Err(VirtError::TaskFailed {
                    upid: upid.to_string(),
                    exit_status: exit,
                });
            }
            if started.elapsed() >= self.task_timeout {
                return Err(VirtError::Timeout(format!(
                    "task {upid} still running after {}s",
                    self.task_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.task_poll_interval).await;
        }
    }

    async fn cluster_vms(&self) -> Result<Vec<ClusterResource>, VirtError> {
        self.get("/cluster/resources?type=vm", None).await
    }

    /// Lowest free VMID at or above the pool start.
    async fn allocate_vmid(&self) -> Result<u32, VirtError> {
        let mut reserved = self.reserved.lock().await;
        let used: HashSet<u32> = self.cluster_vms().await?.into_iter().map(|r| r.vmid).collect();

        let mut vmid = self.vm_pool_start;
        while used.contains(&vmid) || reserved.contains(&vmid) {
            vmid = vmid
                .checked_add(1)
                .ok_or_else(|| VirtError::InvalidResponse("VMID space exhausted".to_string()))?;
        }
        reserved.insert(vmid);
        Ok(vmid)
    }

    async fn clone_and_configure(&self, vmid: u32, spec: &VmSpec) -> Result<(), VirtError> {
        let request = CloneRequest {
            newid: vmid,
            name: spec.name.clone(),
            full: 1,
            target: self.node.clone(),
        };
        let upid: String = self
            .post(&self.qemu_path(self.template_vmid, "/clone"), Some(&request), Some(self.template_vmid))
            .await?;
        debug!(vm_id = vmid, upid = %upid, "Clone task started");
        self.wait_for_task(&upid).await?;

        let update = VmConfigUpdate {
            cores: spec.cores,
            memory: spec.memory_mb,
            tags: spec.tags.join(";"),
        };
        let _: Value = self
            .send(Method::PUT, &self.qemu_path(vmid, "/config"), Some(&update), Some(vmid))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VirtualizationClient for ProxmoxClient {
    #[instrument(skip_all, fields(name = %spec.name))]
    async fn clone_template(&self, spec: &VmSpec) -> Result<u32, VirtError> {
        let vmid = self.allocate_vmid().await?;
        info!(vm_id = vmid, template = self.template_vmid, "Cloning template");

        let result = self.clone_and_configure(vmid, spec).await;
        self.reserved.lock().await.remove(&vmid);

        if let Err(e) = result {
            warn!(vm_id = vmid, error = %e, "Clone failed; removing partial VM");
            match self.destroy(vmid).await {
                Ok(()) => {}
                Err(cleanup) if cleanup.is_not_found() => {}
                Err(cleanup) => {
                    error!(vm_id = vmid, error = %cleanup, "Failed to remove partially cloned VM")
                }
            }
            return Err(e);
        }
        Ok(vmid)
    }

    async fn start(&self, vm_id: u32) -> Result<(), VirtError> {
        let upid: String = self
            .post::<_, ()>(&self.qemu_path(vm_id, "/status/start"), None, Some(vm_id))
            .await?;
        self.wait_for_task(&upid).await?;
        info!(vm_id, "Started VM");
        Ok(())
    }

    async fn status(&self, vm_id: u32) -> Result<VmStatus, VirtError> {
        let current: CurrentStatus = self
            .get(&self.qemu_path(vm_id, "/status/current"), Some(vm_id))
            .await?;
        if current.status != "running" {
            return Ok(VmStatus::default());
        }

        // the guest agent answers with 500 until it is up
        let agent_ready = self
            .post::<Value, ()>(&self.qemu_path(vm_id, "/agent/ping"), None, Some(vm_id))
            .await
            .is_ok();
        let ip_address = if agent_ready {
            self.get::<NetworkInterfaces>(&self.qemu_path(vm_id, "/agent/network-get-interfaces"), Some(vm_id))
                .await
                .ok()
                .and_then(|ifaces| ifaces.first_ipv4())
        } else {
            None
        };

        Ok(VmStatus {
            running: true,
            agent_ready,
            ip_address,
        })
    }

    async fn exec(&self, vm_id: u32, command: &str, timeout: Duration) -> Result<GuestExecResult, VirtError> {
        let request = GuestExecRequest {
            command: vec!["sh".to_string(), "-c".to_string(), command.to_string()],
        };
        let started: GuestExecStarted = self
            .post(&self.qemu_path(vm_id, "/agent/exec"), Some(&request), Some(vm_id))
            .await?;

        let status_path = self.qemu_path(vm_id, &format!("/agent/exec-status?pid={}", started.pid));
        let begun = Instant::now();
        loop {
            let status: GuestExecStatus = self.get(&status_path, Some(vm_id)).await?;
            if status.exited != 0 {
                return Ok(GuestExecResult {
                    exit_code: status.exitcode,
                    stdout: status.out_data.unwrap_or_default(),
                    stderr: status.err_data.unwrap_or_default(),
                });
            }
            if begun.elapsed() >= timeout {
                return Err(VirtError::Timeout(format!(
                    "guest command (pid {}) still running after {}s",
                    started.pid,
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.exec_poll_interval).await;
        }
    }

    async fn write_file(&self, vm_id: u32, path: &str, content: &str) -> Result<(), VirtError> {
        let request = FileWriteRequest {
            file: path.to_string(),
            content: content.to_string(),
        };
        let _: Value = self
            .post(&self.qemu_path(vm_id, "/agent/file-write"), Some(&request), Some(vm_id))
            .await?;
        debug!(vm_id, path, bytes = content.len(), "Wrote guest file");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn destroy(&self, vm_id: u32) -> Result<(), VirtError> {
        let upid: String = self
            .post::<_, ()>(&self.qemu_path(vm_id, "/status/stop"), None, Some(vm_id))
            .await?;
        self.wait_for_task(&upid).await?;

        let upid: String = self
            .send::<_, ()>(
                Method::DELETE,
                &self.qemu_path(vm_id, "?purge=1&destroy-unreferenced-disks=1"),
                None,
                Some(vm_id),
            )
            .await?;
        self.wait_for_task(&upid).await?;
        info!(vm_id, "Destroyed VM");
        Ok(())
    }

    async fn list_tagged(&self, tag: &str) -> Result<Vec<TaggedVm>, VirtError> {
        let vms = self
            .cluster_vms()
            .await?
            .into_iter()
            .filter(|r| r.template != Some(1))
            .filter_map(|r| {
                let tags = r.tag_list();
                tags.iter().any(|t| t == tag).then(|| TaggedVm {
                    vm_id: r.vmid,
                    name: r.name.clone().unwrap_or_default(),
                    tags,
                })
            })
            .collect();
        Ok(vms)
    }
}

/// `proxmox.local:8006` → `https://proxmox.local:8006/api2/json`
fn api_base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    let with_scheme = if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    };
    let authority = with_scheme.split("://").nth(1).unwrap_or_default();
    let with_port = if authority.contains(':') {
        with_scheme
    } else {
        format!("{with_scheme}:8006")
    };
    format!("{with_port}/api2/json")
}

fn classify_error(status: u16, body: String, vm_id: Option<u32>) -> VirtError {
    match (status, vm_id) {
        (401, _) => VirtError::Auth(body),
        (403, _) => VirtError::Auth(format!("permission denied: {body}")),
        (_, Some(id)) if body.contains("does not exist") => VirtError::NotFound(id),
        (_, Some(id)) if status == 404 => VirtError::NotFound(id),
        _ => VirtError::Api { status, body },
    }
}
