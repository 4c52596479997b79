//! Parse job status shared between the job runner and its pollers.
//!
//! ```text
//! submit() → Pending ── start() → Running ──┬── succeed() → Succeeded (terminal)
//!                                           └── fail() ──→ Failed (terminal)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a disposition parse job (UUIDv7, sortable by submission).
pub type JobId = Uuid;

/// Generate a new job id.
pub fn new_job_id() -> JobId {
    Uuid::now_v7()
}

// ============================================================================
// JOB STATUS ENUM
// ============================================================================

/// Status of a disposition parse job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job accepted, not yet picked up by a worker
    Pending,
    /// Worker is parsing the workbook
    Running,
    /// Parse finished and the snapshot was installed
    Succeeded,
    /// Parse failed; error retained on the job record
    Failed,
}

impl JobStatus {
    /// Convert to string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    /// Parse from string representation.
    pub fn from_db_str(s: &str) -> Result<Self, JobStatusParseError> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" | "done" | "success" => Ok(JobStatus::Succeeded),
            "failed" | "error" => Ok(JobStatus::Failed),
            _ => Err(JobStatusParseError(s.to_string())),
        }
    }

    /// Check if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid job status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid job status: {}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

/// Errors when transitioning job states.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobStateError {
    #[error("Job {job_id} is in state {actual} but expected {expected}")]
    WrongState {
        job_id: String,
        expected: JobStatus,
        actual: JobStatus,
    },
}
