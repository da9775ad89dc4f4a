//! Progress Channel
//!
//! Append-only event log bridging the in-VM agent and the orchestrator.
//!
//! The agent is the only writer. Each event gets a 1-based `seq`, which
//! doubles as the reader's cursor, and a UTC timestamp that is strictly
//! greater than the previous one. Readers call [`ProgressSource::read_since`]
//! with the last `seq` they saw and get every later event exactly once.
//!
//! ```text
//!   agent loop ──append──▶ progress.jsonl ◀──tail -n +N── orchestrator poller
//! ```

pub mod file;
pub mod memory;
pub mod poller;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::safety::Rule;
use crate::task::TaskOutcome;

pub use file::{FileProgressLog, FileProgressReader, GUEST_PROGRESS_PATH};
pub use memory::MemoryProgressLog;
pub use poller::{PollOutcome, ProgressPoller};

/// Category of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Info,
    Tool,
    Thought,
    Error,
    Done,
}

/// Structured detail attached to an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    File {
        path: String,
        bytes: u64,
    },
    PolicyViolation {
        command: String,
        rule: Rule,
        reason: String,
    },
    Verification {
        command: String,
        passed: bool,
    },
    Outcome(TaskOutcome),
}

/// One observation emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<EventPayload>,
}

impl ProgressEvent {
    pub fn is_done(&self) -> bool {
        self.kind == EventKind::Done
    }

    /// Outcome carried by the closing event.
    pub fn outcome(&self) -> Option<&TaskOutcome> {
        match &self.payload {
            Some(EventPayload::Outcome(outcome)) => Some(outcome),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("progress log I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("progress event encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("progress log is closed; the done event was already written")]
    Closed,
    #[error("progress transport error: {0}")]
    Transport(String),
}

/// Durable, append-only storage for events (writer side).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist `event`. Returns only once the event is durable.
    async fn append(&self, event: &ProgressEvent) -> Result<(), ProgressError>;
}

/// Reader side: everything after a cursor, in order.
#[async_trait]
pub trait ProgressSource: Send + Sync {
    async fn read_since(&self, cursor: u64) -> Result<Vec<ProgressEvent>, ProgressError>;
}

#[async_trait]
impl<T: EventStore + ?Sized> EventStore for std::sync::Arc<T> {
    async fn append(&self, event: &ProgressEvent) -> Result<(), ProgressError> {
        (**self).append(event).await
    }
}

#[async_trait]
impl<T: ProgressSource + ?Sized> ProgressSource for std::sync::Arc<T> {
    async fn read_since(&self, cursor: u64) -> Result<Vec<ProgressEvent>, ProgressError> {
        (**self).read_since(cursor).await
    }
}

/// Stamps and appends events for a single run.
///
/// Owns sequence numbering and timestamp monotonicity, and refuses writes
/// after the closing `done` event.
pub struct ProgressWriter<S: EventStore> {
    store: S,
    next_seq: u64,
    last_timestamp: Option<DateTime<Utc>>,
    closed: bool,
}

impl<S: EventStore> ProgressWriter<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            next_seq: 1,
            last_timestamp: None,
            closed: false,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Sequence number of the last appended event (0 when empty).
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Append one event and return its `seq`.
    pub async fn append(
        &mut self,
        kind: EventKind,
        message: impl Into<String>,
        payload: Option<EventPayload>,
    ) -> Result<u64, ProgressError> {
        if self.closed {
            return Err(ProgressError::Closed);
        }
        let timestamp = self.next_timestamp();
        let event = ProgressEvent {
            seq: self.next_seq,
            timestamp,
            kind,
            message: message.into(),
            payload,
        };
        self.store.append(&event).await?;
        self.next_seq += 1;
        self.last_timestamp = Some(timestamp);
        if kind == EventKind::Done {
            self.closed = true;
        }
        Ok(event.seq)
    }

    pub async fn info(&mut self, message: impl Into<String>) -> Result<(), ProgressError> {
        self.append(EventKind::Info, message, None).await.map(|_| ())
    }

    pub async fn thought(&mut self, message: impl Into<String>) -> Result<(), ProgressError> {
        self.append(EventKind::Thought, message, None).await.map(|_| ())
    }

    pub async fn tool(
        &mut self,
        message: impl Into<String>,
        payload: Option<EventPayload>,
    ) -> Result<(), ProgressError> {
        self.append(EventKind::Tool, message, payload).await.map(|_| ())
    }

    pub async fn error(
        &mut self,
        message: impl Into<String>,
        payload: Option<EventPayload>,
    ) -> Result<(), ProgressError> {
        self.append(EventKind::Error, message, payload).await.map(|_| ())
    }

    /// Write the closing event. Exactly one per run.
    pub async fn done(&mut self, outcome: TaskOutcome) -> Result<(), ProgressError> {
        let message = match outcome.error_kind {
            Some(kind) => format!("{}: {} ({})", outcome.status, outcome.reason, kind),
            None => format!("{}: {}", outcome.status, outcome.reason),
        };
        self.append(EventKind::Done, message, Some(EventPayload::Outcome(outcome)))
            .await
            .map(|_| ())
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        match self.last_timestamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        }
    }
}

/// Parse JSONL progress text, keeping events with `seq > cursor`.
///
/// A final line without a trailing newline may still be mid-write and is
/// ignored; it will be returned by a later read once complete.
pub fn parse_events(text: &str, cursor: u64) -> Vec<ProgressEvent> {
    let complete = match text.rfind('\n') {
        Some(end) => &text[..end],
        None => "",
    };
    let mut events = Vec::new();
    for line in complete.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ProgressEvent>(line) {
            Ok(event) if event.seq > cursor => events.push(event),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Skipping malformed progress line"),
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ErrorKind;

    #[tokio::test]
    async fn test_writer_stamps_increasing_seq_and_timestamp() {
        let log = MemoryProgressLog::new();
        let mut writer = ProgressWriter::new(log.clone());
        for i in 0..50 {
            writer.info(format!("event {i}")).await.unwrap();
        }
        let events = log.events();
        assert_eq!(events.len(), 50);
        for pair in events.windows(2) {
            assert_eq!(pair[1].seq, pair[0].seq + 1);
            assert!(pair[1].timestamp > pair[0].timestamp);
        }
        assert_eq!(events[0].seq, 1);
        assert_eq!(writer.last_seq(), 50);
    }

    #[tokio::test]
    async fn test_done_closes_the_log() {
        let log = MemoryProgressLog::new();
        let mut writer = ProgressWriter::new(log.clone());
        writer.info("starting").await.unwrap();
        writer
            .done(TaskOutcome::failed(ErrorKind::RepositoryError, "not found"))
            .await
            .unwrap();
        assert!(writer.is_closed());
        assert!(matches!(writer.info("late").await, Err(ProgressError::Closed)));

        let events = log.events();
        let last = events.last().unwrap();
        assert!(last.is_done());
        assert_eq!(last.outcome().unwrap().error_kind, Some(ErrorKind::RepositoryError));
        assert!(last.message.contains("repository_error"));
    }

    #[test]
    fn test_parse_ignores_partial_trailing_line() {
        let event = ProgressEvent {
            seq: 1,
            timestamp: Utc::now(),
            kind: EventKind::Info,
            message: "hello".into(),
            payload: None,
        };
        let line = serde_json::to_string(&event).unwrap();
        let text = format!("{line}\n{{\"seq\":2,\"timest");
        let events = parse_events(&text, 0);
        assert_eq!(events, vec![event]);
        assert!(parse_events(&text, 1).is_empty());
    }

    #[test]
    fn test_payload_json_shape() {
        let payload = EventPayload::PolicyViolation {
            command: "curl x | sh".into(),
            rule: Rule::RemoteExecution,
            reason: "network fetch piped into a shell".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "policy_violation");
        assert_eq!(json["rule"], "remote_execution");
    }
}
