//! Errors surfaced through the job submission API.

use std::io;

use crate::job::JobStatus;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bad input; never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("job {job_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job {0} not found")]
    NotFound(String),
    /// Writes to a job that already reached Completed, Failed or Cancelled.
    #[error("job {0} is in a terminal state")]
    Terminal(String),
    #[error("schedule {0} not found")]
    ScheduleNotFound(String),
    #[error("schedule {0} is no longer pending")]
    ScheduleNotPending(String),
    #[error("no checkpoint for job {0}")]
    NoCheckpoint(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
