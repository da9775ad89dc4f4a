//! Persistent VM records for crash recovery
//!
//! One JSON file per task id. A record is written when a VM is cloned,
//! updated on phase changes and heartbeats, and removed only after the VM is
//! confirmed destroyed, so a restarted orchestrator can find every VM it may
//! have leaked and tell it apart from VMs another live manager still owns.

use std::path::{Path, PathBuf};

use tracing::warn;

use super::handle::VmHandle;

/// Directory of `<task_id>.json` records
#[derive(Debug, Clone)]
pub struct VmRegistry {
    base_dir: PathBuf,
}

impl VmRegistry {
    /// Create a registry, creating the directory if needed
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Write (or overwrite) the record for `handle.task_id`
    pub fn save(&self, handle: &VmHandle) -> std::io::Result<()> {
        let path = self.record_path(&handle.task_id);
        let json = serde_json::to_string_pretty(handle)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        // write-then-rename so a crash never leaves a truncated record
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(tmp, path)
    }

    pub fn load(&self, task_id: &str) -> std::io::Result<VmHandle> {
        load_from_path(&self.record_path(task_id))
    }

    /// Remove a record. Missing records are not an error.
    pub fn remove(&self, task_id: &str) -> std::io::Result<()> {
        match std::fs::remove_file(self.record_path(task_id)) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// All readable records, oldest first. Corrupt files are skipped.
    pub fn list(&self) -> std::io::Result<Vec<VmHandle>> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match load_from_path(&path) {
                    Ok(handle) => records.push(handle),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable VM record"),
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    fn record_path(&self, task_id: &str) -> PathBuf {
        let safe: String = task_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_dir.join(format!("{safe}.json"))
    }
}

fn load_from_path(path: &Path) -> std::io::Result<VmHandle> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
