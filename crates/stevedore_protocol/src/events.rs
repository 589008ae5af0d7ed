//! Realtime event frames fanned out to WS/SSE subscribers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::NormalizedErrorCode;
use crate::ids::JobId;
use crate::types::{JobStatus, Progress};

/// Closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "job.created")]
    JobCreated,
    #[serde(rename = "job.progress")]
    JobProgress,
    #[serde(rename = "job.log")]
    JobLog,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "jobs.deleted")]
    JobsDeleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobCreated => "job.created",
            EventKind::JobProgress => "job.progress",
            EventKind::JobLog => "job.log",
            EventKind::JobCompleted => "job.completed",
            EventKind::JobsDeleted => "jobs.deleted",
        }
    }

    /// Log events are high-volume and independently fetchable over
    /// HTTP, so the hub neither buffers them for replay nor counts
    /// their loss against a subscriber.
    pub fn is_buffered(&self) -> bool {
        !matches!(self, EventKind::JobLog)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable fan-out record. `seq` is strictly monotonic across all
/// events published in one process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub seq: u64,
    pub ts: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub payload: serde_json::Value,
}

// ============================================================================
// Payload shapes
// ============================================================================

/// Payload of `job.progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressPayload {
    pub status: JobStatus,
    pub progress: Progress,
}

/// Payload of `job.log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLogPayload {
    pub level: String,
    pub message: String,
}

/// Payload of `job.completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletedPayload {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<NormalizedErrorCode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletedReason {
    Manual,
    Retention,
}

/// Payload of `jobs.deleted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsDeletedPayload {
    pub job_ids: Vec<JobId>,
    pub reason: DeletedReason,
}
