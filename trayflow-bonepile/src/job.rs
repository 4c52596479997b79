//! Disposition parse jobs.
//!
//! A job moves Pending → Running → Succeeded | Failed. The typed
//! [`ParseJob`] makes illegal transitions unrepresentable; the registry stores
//! status-agnostic [`JobSnapshot`]s and rejects writes over terminal jobs.

use crate::parse::DispositionParseResult;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use trayflow_core::{
    new_job_id, ErrorCode, JobId, JobStateError, JobStatus, Timestamp, TrayflowError,
};

/// Caller-facing reference to a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(pub JobId);

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error retained on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&TrayflowError> for JobFailure {
    fn from(err: &TrayflowError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// State-independent job data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseJobData {
    pub job_id: JobId,
    pub submitted_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub rows_applied: Option<u64>,
    pub error_count: Option<u64>,
    pub upload_id: Option<String>,
    /// Failure retained for `Failed` jobs.
    pub error: Option<JobFailure>,
}

// ============================================================================
// TYPESTATE MARKERS
// ============================================================================

/// Marker trait for job states.
pub trait JobState: private::Sealed + Send + Sync {
    const STATUS: JobStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending;
impl JobState for Pending {
    const STATUS: JobStatus = JobStatus::Pending;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Running;
impl JobState for Running {
    const STATUS: JobStatus = JobStatus::Running;
}

/// Terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Succeeded;
impl JobState for Succeeded {
    const STATUS: JobStatus = JobStatus::Succeeded;
}

/// Terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Failed;
impl JobState for Failed {
    const STATUS: JobStatus = JobStatus::Failed;
}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Pending {}
    impl Sealed for super::Running {}
    impl Sealed for super::Succeeded {}
    impl Sealed for super::Failed {}
}

// ============================================================================
// TYPED JOB
// ============================================================================

#[derive(Debug, Clone)]
pub struct ParseJob<S: JobState> {
    data: ParseJobData,
    _state: PhantomData<S>,
}

impl<S: JobState> ParseJob<S> {
    pub fn data(&self) -> &ParseJobData {
        &self.data
    }

    pub fn job_id(&self) -> JobId {
        self.data.job_id
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle(self.data.job_id)
    }

    pub fn status(&self) -> JobStatus {
        S::STATUS
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            data: self.data.clone(),
            status: S::STATUS,
        }
    }

    fn transition<T: JobState>(self) -> ParseJob<T> {
        ParseJob {
            data: self.data,
            _state: PhantomData,
        }
    }
}

impl ParseJob<Pending> {
    pub fn new(submitted_at: Timestamp) -> Self {
        ParseJob {
            data: ParseJobData {
                job_id: new_job_id(),
                submitted_at,
                started_at: None,
                finished_at: None,
                rows_applied: None,
                error_count: None,
                upload_id: None,
                error: None,
            },
            _state: PhantomData,
        }
    }

    pub fn start(mut self, started_at: Timestamp) -> ParseJob<Running> {
        self.data.started_at = Some(started_at);
        self.transition()
    }

    /// Fail before the worker picked the job up.
    pub fn fail(mut self, finished_at: Timestamp, error: TrayflowError) -> ParseJob<Failed> {
        self.data.finished_at = Some(finished_at);
        self.data.error = Some(JobFailure::from(&error));
        self.transition()
    }
}

impl ParseJob<Running> {
    pub fn succeed(
        mut self,
        finished_at: Timestamp,
        result: &DispositionParseResult,
    ) -> ParseJob<Succeeded> {
        self.data.finished_at = Some(finished_at);
        self.data.rows_applied = Some(result.rows_applied);
        self.data.error_count = Some(result.error_count);
        self.data.upload_id = Some(result.upload_id.clone());
        self.transition()
    }

    pub fn fail(mut self, finished_at: Timestamp, error: TrayflowError) -> ParseJob<Failed> {
        self.data.finished_at = Some(finished_at);
        self.data.error = Some(JobFailure::from(&error));
        self.transition()
    }
}

impl ParseJob<Succeeded> {
    pub fn rows_applied(&self) -> u64 {
        self.data.rows_applied.unwrap_or(0)
    }

    pub fn error_count(&self) -> u64 {
        self.data.error_count.unwrap_or(0)
    }
}

impl ParseJob<Failed> {
    pub fn error(&self) -> Option<&JobFailure> {
        self.data.error.as_ref()
    }
}

// ============================================================================
// STORED JOB
// ============================================================================

/// A job as stored in the registry (status-agnostic).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub data: ParseJobData,
    pub status: JobStatus,
}

impl JobSnapshot {
    pub fn job_id(&self) -> JobId {
        self.data.job_id
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn wrong_state(&self, expected: JobStatus) -> JobStateError {
        JobStateError::WrongState {
            job_id: self.data.job_id.to_string(),
            expected,
            actual: self.status,
        }
    }

    pub fn into_pending(self) -> Result<ParseJob<Pending>, JobStateError> {
        self.into_typed()
    }

    pub fn into_running(self) -> Result<ParseJob<Running>, JobStateError> {
        self.into_typed()
    }

    fn into_typed<S: JobState>(self) -> Result<ParseJob<S>, JobStateError> {
        if self.status != S::STATUS {
            return Err(self.wrong_state(S::STATUS));
        }
        Ok(ParseJob {
            data: self.data,
            _state: PhantomData,
        })
    }
}

impl<S: JobState> From<ParseJob<S>> for JobSnapshot {
    fn from(job: ParseJob<S>) -> Self {
        JobSnapshot {
            data: job.data,
            status: S::STATUS,
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Job records keyed by id.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<JobId, JobSnapshot>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a job's current state.
    ///
    /// A job that already reached a terminal state is never overwritten.
    pub fn record<S: JobState>(&self, job: &ParseJob<S>) -> Result<(), JobStateError> {
        let snapshot = job.snapshot();
        let (job_id, status) = (snapshot.job_id(), snapshot.status);
        match self.jobs.entry(job_id) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_terminal() {
                    return Err(existing.get().wrong_state(status));
                }
                existing.insert(snapshot);
            }
            Entry::Vacant(slot) => {
                slot.insert(snapshot);
            }
        }
        tracing::info!(job_id = %job_id, status = %status, "Parse job transition");
        Ok(())
    }

    pub fn get(&self, handle: &JobHandle) -> Option<JobSnapshot> {
        self.jobs.get(&handle.0).map(|j| j.value().clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use trayflow_core::ParseFailure;

    #[test]
    fn test_happy_path_transitions() {
        let registry = JobRegistry::new();
        let job = ParseJob::new(Utc::now());
        let handle = job.handle();
        registry.record(&job).unwrap();
        assert_eq!(registry.get(&handle).unwrap().status, JobStatus::Pending);

        let pending = registry.get(&handle).unwrap().into_pending().unwrap();
        let running = pending.start(Utc::now());
        registry.record(&running).unwrap();
        assert_eq!(registry.get(&handle).unwrap().status, JobStatus::Running);
        assert!(registry.get(&handle).unwrap().data.started_at.is_some());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let registry = JobRegistry::new();
        let job = ParseJob::new(Utc::now());
        let handle = job.handle();
        let running = job.start(Utc::now());
        let failed = running
            .clone()
            .fail(Utc::now(), ParseFailure::NoSheets.into());
        registry.record(&failed).unwrap();

        let err = registry.record(&running).unwrap_err();
        assert!(matches!(
            err,
            JobStateError::WrongState {
                actual: JobStatus::Failed,
                ..
            }
        ));
        let snapshot = registry.get(&handle).unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert!(snapshot.clone().into_running().is_err());
        assert!(snapshot.clone().into_pending().is_err());
        let failure = snapshot.data.error.unwrap();
        assert_eq!(failure.code, ErrorCode::ParseFailure);
    }

    #[test]
    fn test_snapshot_roundtrip_into_typed() {
        let job = ParseJob::new(Utc::now());
        let snapshot: JobSnapshot = job.clone().into();
        let back = snapshot.into_pending().unwrap();
        assert_eq!(back.job_id(), job.job_id());
        assert_eq!(back.status(), JobStatus::Pending);
    }
}
