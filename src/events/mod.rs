//! Execution events and their fan-out to observers.
//!
//! Events are advisory facts about job progress. They are not persisted and an
//! observer that connects mid-run only sees what is published afterwards.
//!
//! # Wire format
//!
//! Observers receive one JSON object per event:
//!
//! ```json
//! {"type":"status","payload":{"hostId":"h1","jobId":"...","status":"running"}}
//! {"type":"output","payload":{"hostId":"h1","jobId":"...","stream":"stdout","data":"..."}}
//! ```

pub mod hub;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use hub::{BroadcastHub, ObserverId, Subscription};

/// Per-host status as shown to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl HostStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, HostStatus::Success | HostStatus::Error)
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostStatus::Pending => write!(f, "pending"),
            HostStatus::Running => write!(f, "running"),
            HostStatus::Success => write!(f, "success"),
            HostStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Status(HostStatus),
    Output { stream: OutputStream, data: String },
}

/// An immutable fact about one job, pushed to every observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionEvent {
    pub job_id: Uuid,
    pub host_id: String,
    pub kind: EventKind,
}

impl ExecutionEvent {
    pub fn status(job_id: Uuid, host_id: impl Into<String>, status: HostStatus) -> Self {
        Self {
            job_id,
            host_id: host_id.into(),
            kind: EventKind::Status(status),
        }
    }

    pub fn output(
        job_id: Uuid,
        host_id: impl Into<String>,
        stream: OutputStream,
        data: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            host_id: host_id.into(),
            kind: EventKind::Output {
                stream,
                data: data.into(),
            },
        }
    }

    pub fn host_status(&self) -> Option<HostStatus> {
        match self.kind {
            EventKind::Status(status) => Some(status),
            EventKind::Output { .. } => None,
        }
    }

    pub fn output_chunk(&self) -> Option<(OutputStream, &str)> {
        match &self.kind {
            EventKind::Output { stream, data } => Some((*stream, data.as_str())),
            EventKind::Status(_) => None,
        }
    }

    /// Terminal status of the job, if this event carries one.
    pub fn terminal_status(&self) -> Option<HostStatus> {
        match self.kind {
            EventKind::Status(status) if status.is_terminal() => Some(status),
            _ => None,
        }
    }

    pub fn to_message(&self) -> EventMessage {
        match &self.kind {
            EventKind::Status(status) => EventMessage::Status {
                host_id: self.host_id.clone(),
                job_id: self.job_id,
                status: *status,
            },
            EventKind::Output { stream, data } => EventMessage::Output {
                host_id: self.host_id.clone(),
                job_id: self.job_id,
                stream: *stream,
                data: data.clone(),
            },
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_message())
    }
}

/// Observer-facing message shape: `{"type": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum EventMessage {
    #[serde(rename_all = "camelCase")]
    Status {
        host_id: String,
        job_id: Uuid,
        status: HostStatus,
    },
    #[serde(rename_all = "camelCase")]
    Output {
        host_id: String,
        job_id: Uuid,
        stream: OutputStream,
        data: String,
    },
}
