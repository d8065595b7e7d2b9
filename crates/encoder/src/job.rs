//! Job records for the encoding pipeline.
//!
//! An [`EncodingJob`] is one attempt to transcode one chapter's input file
//! to one output file. Jobs live in the queue's in-memory table and are
//! mutated only by the worker that currently owns them (or by the queue's
//! cancel/retry operations under its lock).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Status of an encoding job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingStatus {
    /// Job is waiting in the queue.
    Pending,
    /// Job is being processed by a worker.
    Processing,
    /// Job completed successfully.
    Completed,
    /// Job failed with an error.
    Failed,
    /// Job was cancelled before a worker claimed it.
    Cancelled,
}

impl Default for EncodingStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for EncodingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingStatus::Pending => write!(f, "pending"),
            EncodingStatus::Processing => write!(f, "processing"),
            EncodingStatus::Completed => write!(f, "completed"),
            EncodingStatus::Failed => write!(f, "failed"),
            EncodingStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl EncodingStatus {
    /// Check if this status is terminal (completed, failed, or cancelled).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EncodingStatus::Completed | EncodingStatus::Failed | EncodingStatus::Cancelled
        )
    }

    /// All status variants, for per-status statistics.
    pub fn all() -> [EncodingStatus; 5] {
        [
            EncodingStatus::Pending,
            EncodingStatus::Processing,
            EncodingStatus::Completed,
            EncodingStatus::Failed,
            EncodingStatus::Cancelled,
        ]
    }
}

/// One attempt to transcode one input file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingJob {
    /// Unique job identifier (UUID).
    pub job_id: String,
    /// Chapter that owns this job's result.
    pub chapter_id: String,
    /// Book the chapter belongs to, used for directory scoping.
    pub book_id: String,
    /// Path to the input audio file.
    pub input_path: String,
    /// Path for the encoded output file.
    pub output_path: String,
    /// Current status.
    pub status: EncodingStatus,
    /// Completion fraction in [0.0, 1.0], non-decreasing until terminal.
    pub progress: f64,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at_ms: i64,
    /// Unix timestamp (milliseconds) when a worker first claimed the job.
    pub started_at_ms: Option<i64>,
    /// Unix timestamp (milliseconds) of the terminal transition.
    pub completed_at_ms: Option<i64>,
    /// Error text captured on failure; cleared on retry.
    pub error_message: Option<String>,
    /// Number of retries so far.
    pub retry_count: u32,
    /// Retry ceiling from the environment profile.
    pub max_retries: u32,
    /// Audio properties derived from the transcoder output on success.
    pub metadata: Option<HashMap<String, Value>>,
}

impl EncodingJob {
    /// Create a new pending job with a fresh UUID.
    pub fn new(
        chapter_id: &str,
        book_id: &str,
        input_path: &str,
        output_path: &str,
        max_retries: u32,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            chapter_id: chapter_id.to_string(),
            book_id: book_id.to_string(),
            input_path: input_path.to_string(),
            output_path: output_path.to_string(),
            status: EncodingStatus::Pending,
            progress: 0.0,
            created_at_ms: now_ms(),
            started_at_ms: None,
            completed_at_ms: None,
            error_message: None,
            retry_count: 0,
            max_retries,
            metadata: None,
        }
    }

    /// Advance progress; values below the current one are ignored so
    /// progress never decreases.
    pub fn set_progress(&mut self, progress: f64) {
        if progress > self.progress {
            self.progress = progress.min(1.0);
        }
    }

    /// Transition to Failed with the captured error text.
    pub fn fail(&mut self, reason: &str) {
        self.status = EncodingStatus::Failed;
        self.error_message = Some(reason.to_string());
        self.completed_at_ms = Some(now_ms());
    }

    /// Transition to Completed with the transcoder-derived metadata.
    pub fn complete(&mut self, metadata: HashMap<String, Value>) {
        self.status = EncodingStatus::Completed;
        self.progress = 1.0;
        self.metadata = Some(metadata);
        self.error_message = None;
        self.completed_at_ms = Some(now_ms());
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock processing time in seconds, if both endpoints are set.
    pub fn processing_secs(&self) -> Option<f64> {
        match (self.started_at_ms, self.completed_at_ms) {
            (Some(start), Some(end)) if end >= start => Some((end - start) as f64 / 1000.0),
            _ => None,
        }
    }

    /// Check whether another retry is permitted.
    pub fn can_retry(&self) -> bool {
        self.status == EncodingStatus::Failed && self.retry_count < self.max_retries
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
