//! Events and snapshots exposed to the presentation layer.
//!
//! The engine never blocks on the consumer: events are pushed with
//! `try_send` and silently dropped if the channel is full or closed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Stable identifier for a queued job.
pub type JobId = Uuid;

/// Stage a transfer moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStage {
    Chunking,
    Transferring,
    Merging,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

/// Event emitted by the engine for the presentation layer.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A file transfer moved to a new stage.
    Stage {
        file_id: String,
        stage: TransferStage,
    },
    /// Per-chunk progress for the active transfer.
    ChunkProgress {
        file_id: String,
        done: usize,
        total: usize,
    },
    /// A queue job finished successfully.
    JobCompleted { job_id: JobId, file_id: String },
    /// A queue job failed terminally (includes exhausted retries).
    JobFailed {
        job_id: JobId,
        file_id: Option<String>,
        error: String,
    },
    /// A queue job was cancelled by the user.
    JobCancelled { job_id: JobId },
    /// The queue paused after a rate-limit error; the whole batch is
    /// re-enqueued at `resume_at`.
    QueuePaused { resume_at: DateTime<Utc> },
    /// State snapshot of the queue.
    Snapshot(QueueSnapshot),
}

/// Summary of one job for snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub description: String,
}

/// Point-in-time view of the queue for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub active: Option<JobInfo>,
    pub queued: Vec<JobInfo>,
    /// Jobs parked in a rate-limit retry batch.
    pub awaiting_retry: Vec<JobInfo>,
    /// When the retry batch re-enqueues, if the queue is paused.
    pub paused_until: Option<DateTime<Utc>>,
}
