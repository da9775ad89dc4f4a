//! JSONL file transport for the progress channel.
//!
//! Inside the VM the agent appends to `/opt/agent/progress.jsonl`; the
//! orchestrator reads the same file through the guest agent.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{parse_events, EventStore, ProgressError, ProgressEvent, ProgressSource};

/// Default location of the progress log inside the agent VM.
pub const GUEST_PROGRESS_PATH: &str = "/opt/agent/progress.jsonl";

pub struct FileProgressLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileProgressLog {
    /// Create (or truncate) the log at `path`.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, ProgressError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventStore for FileProgressLog {
    async fn append(&self, event: &ProgressEvent) -> Result<(), ProgressError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl ProgressSource for FileProgressLog {
    async fn read_since(&self, cursor: u64) -> Result<Vec<ProgressEvent>, ProgressError> {
        read_log(&self.path, cursor).await
    }
}

/// Read-only view of a progress log written by another process.
#[derive(Debug, Clone)]
pub struct FileProgressReader {
    path: PathBuf,
}

impl FileProgressReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ProgressSource for FileProgressReader {
    async fn read_since(&self, cursor: u64) -> Result<Vec<ProgressEvent>, ProgressError> {
        read_log(&self.path, cursor).await
    }
}

async fn read_log(path: &Path, cursor: u64) -> Result<Vec<ProgressEvent>, ProgressError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(parse_events(&text, cursor)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressWriter;

    #[tokio::test]
    async fn test_reader_resumes_from_cursor_without_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent").join("progress.jsonl");
        let log = FileProgressLog::create(&path).await.unwrap();
        let mut writer = ProgressWriter::new(log);

        for i in 0..3 {
            writer.info(format!("step {i}")).await.unwrap();
        }

        let reader = FileProgressReader::new(&path);
        let first = reader.read_since(0).await.unwrap();
        assert_eq!(first.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);

        writer.info("step 3").await.unwrap();
        writer.info("step 4").await.unwrap();

        let cursor = first.last().unwrap().seq;
        let second = reader.read_since(cursor).await.unwrap();
        assert_eq!(second.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(second[0].message, "step 3");
        assert!(reader.read_since(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reader = FileProgressReader::new(dir.path().join("nope.jsonl"));
        assert!(reader.read_since(0).await.unwrap().is_empty());
    }
}
