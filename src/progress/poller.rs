//! Cursor-tracking reader with a liveness timeout.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::{ProgressEvent, ProgressSource};

/// Result of one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// New events, in order. The cursor has already advanced past them.
    Events(Vec<ProgressEvent>),
    /// Nothing new, still within the liveness window.
    Idle,
    /// Nothing new for longer than the liveness timeout.
    Stale { silent_for: Duration },
}

/// Polls a [`ProgressSource`] from a monotonically advancing cursor.
///
/// Read errors and slow reads count as "no new events": an unreachable VM
/// shows up as [`PollOutcome::Stale`] rather than as a hang.
pub struct ProgressPoller<S: ProgressSource> {
    source: S,
    cursor: u64,
    liveness_timeout: Duration,
    read_timeout: Duration,
    last_activity: Instant,
    done: bool,
}

impl<S: ProgressSource> ProgressPoller<S> {
    pub fn new(source: S, liveness_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            source,
            cursor: 0,
            liveness_timeout,
            read_timeout,
            last_activity: Instant::now(),
            done: false,
        }
    }

    /// Resume from a cursor saved before a disconnect.
    pub fn with_cursor(mut self, cursor: u64) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// True once the closing `done` event has been read.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub async fn poll(&mut self) -> PollOutcome {
        let read = tokio::time::timeout(self.read_timeout, self.source.read_since(self.cursor)).await;
        let events = match read {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                debug!(cursor = self.cursor, error = %e, "Progress read failed");
                Vec::new()
            }
            Err(_) => {
                debug!(cursor = self.cursor, "Progress read timed out");
                Vec::new()
            }
        };

        // only strictly newer events count, even if the source overlaps
        let mut accepted = Vec::with_capacity(events.len());
        for event in events {
            if event.seq <= self.cursor {
                continue;
            }
            self.cursor = event.seq;
            if event.is_done() {
                self.done = true;
            }
            accepted.push(event);
        }

        if !accepted.is_empty() {
            self.last_activity = Instant::now();
            return PollOutcome::Events(accepted);
        }

        let silent_for = self.last_activity.elapsed();
        if silent_for >= self.liveness_timeout {
            PollOutcome::Stale { silent_for }
        } else {
            PollOutcome::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{MemoryProgressLog, ProgressError, ProgressWriter};
    use crate::task::TaskOutcome;
    use async_trait::async_trait;

    #[tokio::test]
    async fn test_poller_advances_cursor_and_sees_done() {
        let log = MemoryProgressLog::new();
        let mut writer = ProgressWriter::new(log.clone());
        let mut poller = ProgressPoller::new(log.clone(), Duration::from_secs(60), Duration::from_secs(1));

        assert_eq!(poller.poll().await, PollOutcome::Idle);

        writer.info("cloning").await.unwrap();
        writer.info("planning").await.unwrap();
        match poller.poll().await {
            PollOutcome::Events(events) => assert_eq!(events.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(poller.cursor(), 2);
        assert_eq!(poller.poll().await, PollOutcome::Idle);

        writer.done(TaskOutcome::succeeded("ok", vec![], None)).await.unwrap();
        assert!(matches!(poller.poll().await, PollOutcome::Events(e) if e.len() == 1));
        assert!(poller.is_done());
    }

    struct Unreachable;

    #[async_trait]
    impl ProgressSource for Unreachable {
        async fn read_since(&self, _cursor: u64) -> Result<Vec<ProgressEvent>, ProgressError> {
            Err(ProgressError::Transport("guest agent not responding".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_source_goes_stale() {
        let mut poller = ProgressPoller::new(Unreachable, Duration::from_secs(30), Duration::from_secs(5));
        assert_eq!(poller.poll().await, PollOutcome::Idle);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(poller.poll().await, PollOutcome::Stale { .. }));
    }
}
