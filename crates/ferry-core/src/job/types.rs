//! Types describing one requested transfer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque job identifier (UUID text).
pub type JobId = String;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Admitted,
    Transferring,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Admitted => "admitted",
            JobStatus::Transferring => "transferring",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, Failed and Cancelled accept no further writes.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Holds one of the `max_concurrent` slots.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Admitted | JobStatus::Transferring)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "admitted" => Ok(JobStatus::Admitted),
            "transferring" => Ok(JobStatus::Transferring),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Admission-order hint; higher is admitted first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// A submission before it becomes a job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub url: String,
    /// File path, or an existing directory to derive the file name in.
    pub destination: PathBuf,
    pub owner: String,
    pub priority: Priority,
}

impl JobRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            owner: String::new(),
            priority: Priority::Normal,
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// One requested transfer and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub url: String,
    pub destination_path: PathBuf,
    pub owner: String,
    pub status: JobStatus,
    pub priority: Priority,
    /// 0 while unknown.
    pub bytes_total: u64,
    pub bytes_done: u64,
    /// Bytes per second over the last report window; not persisted.
    #[serde(skip)]
    pub transfer_rate: f64,
    /// The finished part file is being moved into place; pause and cancel
    /// are refused from here on.
    #[serde(skip)]
    pub finalizing: bool,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
}

/// Read-only copy handed out by the registry.
pub type JobSnapshot = Job;

impl Job {
    /// Fraction complete in [0.0, 1.0]; 0 while the size is unknown.
    pub fn fraction(&self) -> f64 {
        if self.bytes_total == 0 {
            return if self.status == JobStatus::Completed { 1.0 } else { 0.0 };
        }
        (self.bytes_done as f64 / self.bytes_total as f64).min(1.0)
    }
}

/// Filter for `JobRegistry::list`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub owner: Option<String>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn owner(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            status: None,
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.owner.as_deref().map_or(true, |o| job.owner == o)
            && self.status.map_or(true, |s| job.status == s)
    }
}

/// Current time as Unix seconds.
pub(crate) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
