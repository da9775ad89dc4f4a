//! Reading the in-VM progress log through the guest agent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::client::VirtualizationClient;
use crate::progress::{parse_events, ProgressError, ProgressEvent, ProgressSource};

/// [`ProgressSource`] over `tail -n +<cursor+1>` of the guest's JSONL log.
///
/// Line `n` of the log holds the event with `seq == n`, so the tail offset
/// is the cursor plus one.
pub struct GuestProgressReader<C: VirtualizationClient> {
    client: Arc<C>,
    vm_id: u32,
    path: String,
    exec_timeout: Duration,
}

impl<C: VirtualizationClient> GuestProgressReader<C> {
    pub fn new(client: Arc<C>, vm_id: u32, path: impl Into<String>, exec_timeout: Duration) -> Self {
        Self {
            client,
            vm_id,
            path: path.into(),
            exec_timeout,
        }
    }
}

/// Shell command that prints the log from event `cursor + 1` onwards.
pub fn tail_command(path: &str, cursor: u64) -> String {
    format!("tail -n +{} {} 2>/dev/null || true", cursor + 1, path)
}

#[async_trait]
impl<C: VirtualizationClient> ProgressSource for GuestProgressReader<C> {
    async fn read_since(&self, cursor: u64) -> Result<Vec<ProgressEvent>, ProgressError> {
        let command = tail_command(&self.path, cursor);
        let output = self
            .client
            .exec(self.vm_id, &command, self.exec_timeout)
            .await
            .map_err(|e| ProgressError::Transport(e.to_string()))?;
        Ok(parse_events(&output.stdout, cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_command() {
        assert_eq!(
            tail_command("/opt/agent/progress.jsonl", 0),
            "tail -n +1 /opt/agent/progress.jsonl 2>/dev/null || true"
        );
        assert!(tail_command("/x", 41).starts_with("tail -n +42 "));
    }
}
