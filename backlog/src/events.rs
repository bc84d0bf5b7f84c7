use crate::JobId;
use crate::JobRecord;
use crate::JobState;
use chrono::{DateTime, Utc};
use serde_derive::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// Lifecycle transitions reported to an [`EventSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Enqueued,
    Started,
    Completed,
    Failed,
    Retrying,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub kind: EventKind,
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobEvent {
    pub fn new<P>(kind: EventKind, record: &JobRecord<P>) -> Self {
        let error = match kind {
            EventKind::Failed | EventKind::Retrying => record.last_error.clone(),
            _ => None,
        };

        JobEvent {
            kind,
            id: record.id.clone(),
            name: record.name.clone(),
            state: record.state,
            attempts: record.attempts,
            timestamp: Utc::now(),
            error,
        }
    }
}

/// Receives lifecycle events. Implementations must not block,
/// they are called from the dispatcher loop.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &JobEvent);
}

/// Writes events through the `log` facade.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    json: bool,
}

impl LogSink {
    pub fn plain() -> Self {
        LogSink { json: false }
    }

    /// One JSON object per event
    pub fn json() -> Self {
        LogSink { json: true }
    }
}

impl EventSink for LogSink {
    fn emit(&self, event: &JobEvent) {
        let level = match event.kind {
            EventKind::Failed => log::Level::Error,
            EventKind::Retrying => log::Level::Warn,
            _ => log::Level::Debug,
        };

        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => log::log!(target: "backlog::events", level, "{line}"),
                Err(error) => log::error!("Failed to serialize job event {:?}", error),
            }

            return;
        }

        match &event.error {
            Some(error) => log::log!(
                target: "backlog::events",
                level,
                "job {} ({}) {:?} attempts={} error={}",
                event.id,
                event.name,
                event.kind,
                event.attempts,
                error
            ),
            None => log::log!(
                target: "backlog::events",
                level,
                "job {} ({}) {:?} attempts={}",
                event.id,
                event.name,
                event.kind,
                event.attempts
            ),
        }
    }
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: UnboundedSender<JobEvent>,
}

impl ChannelSink {
    pub fn new(sender: UnboundedSender<JobEvent>) -> Self {
        ChannelSink { sender }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &JobEvent) {
        // a closed receiver only means nobody listens anymore
        let _ = self.sender.send(event.clone());
    }
}
