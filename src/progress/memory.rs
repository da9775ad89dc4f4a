//! In-process progress log, shared between a writer and any number of readers.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{EventStore, ProgressError, ProgressEvent, ProgressSource};

#[derive(Debug, Clone, Default)]
pub struct MemoryProgressLog {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl MemoryProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event appended so far.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for MemoryProgressLog {
    async fn append(&self, event: &ProgressEvent) -> Result<(), ProgressError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| ProgressError::Transport("progress log lock poisoned".to_string()))?;
        events.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl ProgressSource for MemoryProgressLog {
    async fn read_since(&self, cursor: u64) -> Result<Vec<ProgressEvent>, ProgressError> {
        let events = self
            .events
            .lock()
            .map_err(|_| ProgressError::Transport("progress log lock poisoned".to_string()))?;
        Ok(events.iter().filter(|e| e.seq > cursor).cloned().collect())
    }
}
