//! Job events for observers of the worker pool.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::status::{JobId, JobStatus};

/// What happened to a delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEventKind {
    /// The job was claimed and is being worked on.
    Started,
    /// The job left `running`: completed, skipped or awaiting approval.
    Finished { status: JobStatus },
    /// The attempt failed and the task went back to the broker.
    Retrying { error: String },
    /// The job was marked failed.
    Failed { error: String },
    /// The delivery was acknowledged without doing anything.
    Ignored { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: JobId,
    pub document_id: i64,
    pub attempt: u32,
    #[serde(flatten)]
    pub kind: JobEventKind,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: JobId, document_id: i64, attempt: u32, kind: JobEventKind) -> Self {
        Self {
            job_id,
            document_id,
            attempt,
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out of [`JobEvent`]s. Sending with no subscribers is not an error.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_receives_events() {
        let events = JobEventBroadcaster::new(8);
        let mut rx = events.subscribe();
        events.send(JobEvent::new(JobId(1), 10, 1, JobEventKind::Started));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.job_id, JobId(1));
        assert_eq!(event.kind, JobEventKind::Started);
    }

    #[test]
    fn test_send_without_subscribers_is_silent() {
        JobEventBroadcaster::default().send(JobEvent::new(
            JobId(1),
            10,
            1,
            JobEventKind::Ignored {
                reason: "duplicate".into(),
            },
        ));
    }

    #[test]
    fn test_event_serializes_flat() {
        let event = JobEvent::new(
            JobId(3),
            30,
            2,
            JobEventKind::Finished {
                status: JobStatus::Completed,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["jobId"], 3);
        assert_eq!(json["kind"], "finished");
        assert_eq!(json["status"], "completed");
    }
}
