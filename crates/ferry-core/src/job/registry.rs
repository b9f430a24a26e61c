//! In-memory job registry: the single owner of job lifecycle.
//!
//! All mutations (status transitions, byte counters) go through one mutex.
//! Callers only ever see cloned snapshots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::state::can_transition;
use super::types::{unix_timestamp, Job, JobFilter, JobId, JobRequest, JobSnapshot, JobStatus, Priority};
use crate::checkpoint::Checkpoint;
use crate::error::{EngineError, EngineResult};
use crate::url_model;

/// Optional fields written together with a status change.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub error: Option<String>,
    pub bytes_done: Option<u64>,
    pub bytes_total: Option<u64>,
}

impl TransitionFields {
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            error: Some(msg.into()),
            ..Self::default()
        }
    }

    pub fn bytes(done: u64, total: u64) -> Self {
        Self {
            error: None,
            bytes_done: Some(done),
            bytes_total: Some(total),
        }
    }
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate a request and insert a Pending job. Returns the new id.
    ///
    /// If `destination` is a directory, the file name is derived from the URL
    /// and made unique among existing files and live jobs.
    pub fn create(&self, req: &JobRequest) -> EngineResult<JobId> {
        validate_url(&req.url)?;
        let as_dir = req.destination.is_dir() || ends_with_separator(&req.destination);
        let dir = if as_dir {
            req.destination.clone()
        } else {
            parent_dir(&req.destination)
        };
        ensure_writable_dir(&dir)?;

        let mut jobs = self.lock();
        let destination = if as_dir {
            let taken: Vec<PathBuf> = jobs
                .values()
                .filter(|j| !j.status.is_terminal())
                .map(|j| j.destination_path.clone())
                .collect();
            let name = url_model::derive_filename(&req.url, None);
            url_model::unique_path(&dir, &name, |p| taken.iter().any(|t| t == p))
        } else {
            req.destination.clone()
        };
        if let Some(owner) = live_owner_of(&jobs, &destination) {
            return Err(EngineError::InvalidRequest(format!(
                "destination {} is already owned by job {}",
                destination.display(),
                owner
            )));
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let job = new_job(id.clone(), req.url.clone(), destination, req.owner.clone(), req.priority);
        tracing::debug!(job_id = %id, url = %job.url, dest = %job.destination_path.display(), "job created");
        jobs.insert(id.clone(), job);
        Ok(id)
    }

    /// Re-create a Pending job from a checkpoint left by an earlier run,
    /// keeping the checkpoint's job id so the partial file is picked up.
    pub fn adopt(&self, cp: &Checkpoint, owner: &str, priority: Priority) -> EngineResult<JobId> {
        validate_url(&cp.url)?;
        let mut jobs = self.lock();
        if let Some(existing) = jobs.get(&cp.job_id) {
            if !existing.status.is_terminal() {
                return Err(EngineError::InvalidRequest(format!(
                    "job {} is already live",
                    cp.job_id
                )));
            }
        }
        if let Some(other) = live_owner_of(&jobs, &cp.destination_path) {
            if other != cp.job_id {
                return Err(EngineError::InvalidRequest(format!(
                    "destination {} is already owned by job {}",
                    cp.destination_path.display(),
                    other
                )));
            }
        }
        let mut job = new_job(
            cp.job_id.clone(),
            cp.url.clone(),
            cp.destination_path.clone(),
            owner.to_string(),
            priority,
        );
        job.bytes_done = cp.bytes_confirmed;
        job.bytes_total = cp.bytes_total;
        jobs.insert(cp.job_id.clone(), job);
        Ok(cp.job_id.clone())
    }

    /// Apply a status change, enforcing the state machine.
    pub fn transition(
        &self,
        id: &str,
        to: JobStatus,
        fields: TransitionFields,
    ) -> EngineResult<JobSnapshot> {
        self.move_to(id, to, fields).map(|(_, job)| job)
    }

    /// `transition`, also returning the status the job left.
    pub fn move_to(
        &self,
        id: &str,
        to: JobStatus,
        fields: TransitionFields,
    ) -> EngineResult<(JobStatus, JobSnapshot)> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if job.finalizing && !matches!(to, JobStatus::Completed | JobStatus::Failed) {
            return Err(EngineError::Terminal(id.to_string()));
        }
        if !can_transition(job.status, to) {
            return Err(EngineError::InvalidTransition {
                job_id: id.to_string(),
                from: job.status,
                to,
            });
        }
        let from = job.status;
        job.status = to;
        let now = unix_timestamp();
        if to == JobStatus::Transferring && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if let Some(total) = fields.bytes_total {
            job.bytes_total = total;
        }
        if let Some(done) = fields.bytes_done {
            job.bytes_done = done;
        }
        if let Some(err) = fields.error {
            job.last_error = Some(err);
        }
        if to.is_terminal() || to == JobStatus::Paused {
            job.transfer_rate = 0.0;
        }
        if to.is_terminal() {
            job.ended_at = Some(now);
            job.finalizing = false;
        }
        tracing::debug!(job_id = %id, %from, %to, "job transition");
        Ok((from, job.clone()))
    }

    /// Claim a Transferring job for the final move into place. Fails if a
    /// pause or cancel got there first; once it succeeds both are refused
    /// until the job reaches Completed or Failed.
    pub fn begin_finalize(&self, id: &str) -> EngineResult<()> {
        let mut jobs = self.lock();
        let job = live_job(&mut jobs, id)?;
        if job.status != JobStatus::Transferring {
            return Err(EngineError::InvalidTransition {
                job_id: id.to_string(),
                from: job.status,
                to: JobStatus::Completed,
            });
        }
        job.finalizing = true;
        Ok(())
    }

    /// Record streaming progress. `bytes_done` never moves backwards here;
    /// use `restart_progress` for an explicit restart from zero.
    pub fn update_progress(
        &self,
        id: &str,
        bytes_done: u64,
        bytes_total: u64,
        rate: f64,
    ) -> EngineResult<()> {
        let mut jobs = self.lock();
        let job = live_job(&mut jobs, id)?;
        job.bytes_done = job.bytes_done.max(bytes_done);
        if bytes_total > 0 {
            job.bytes_total = bytes_total.max(job.bytes_done);
        }
        job.transfer_rate = rate;
        Ok(())
    }

    /// The server ignored our range request; the file starts over.
    pub fn restart_progress(&self, id: &str, bytes_total: u64) -> EngineResult<()> {
        let mut jobs = self.lock();
        let job = live_job(&mut jobs, id)?;
        job.bytes_done = 0;
        job.bytes_total = bytes_total;
        Ok(())
    }

    /// Count a retry; `error` replaces the previous `last_error`.
    pub fn record_retry(&self, id: &str, retry_count: u32, error: &str) -> EngineResult<()> {
        let mut jobs = self.lock();
        let job = live_job(&mut jobs, id)?;
        job.retry_count = retry_count;
        job.last_error = Some(error.to_string());
        Ok(())
    }

    /// Only meaningful while the job waits for admission.
    pub fn set_priority(&self, id: &str, priority: Priority) -> EngineResult<()> {
        let mut jobs = self.lock();
        live_job(&mut jobs, id)?.priority = priority;
        Ok(())
    }

    /// Move a job to a new destination (extension inference at completion).
    pub fn set_destination(&self, id: &str, path: PathBuf) -> EngineResult<()> {
        let mut jobs = self.lock();
        if let Some(owner) = live_owner_of(&jobs, &path) {
            if owner != id {
                return Err(EngineError::InvalidRequest(format!(
                    "destination {} is already owned by job {}",
                    path.display(),
                    owner
                )));
            }
        }
        live_job(&mut jobs, id)?.destination_path = path;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<JobSnapshot> {
        self.lock().get(id).cloned()
    }

    pub fn status(&self, id: &str) -> Option<JobStatus> {
        self.lock().get(id).map(|j| j.status)
    }

    /// Snapshots matching `filter`, oldest first.
    pub fn list(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        let mut out: Vec<JobSnapshot> = self
            .lock()
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Number of jobs currently in `status`.
    pub fn count(&self, status: JobStatus) -> usize {
        self.lock().values().filter(|j| j.status == status).count()
    }

    /// True when no job is outside a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.lock().values().all(|j| j.status.is_terminal())
    }
}

fn new_job(id: JobId, url: String, destination: PathBuf, owner: String, priority: Priority) -> Job {
    Job {
        id,
        url,
        destination_path: destination,
        owner,
        status: JobStatus::Pending,
        priority,
        bytes_total: 0,
        bytes_done: 0,
        transfer_rate: 0.0,
        finalizing: false,
        retry_count: 0,
        last_error: None,
        created_at: unix_timestamp(),
        started_at: None,
        ended_at: None,
    }
}

fn live_job<'a>(jobs: &'a mut HashMap<JobId, Job>, id: &str) -> EngineResult<&'a mut Job> {
    let job = jobs
        .get_mut(id)
        .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
    if job.status.is_terminal() {
        return Err(EngineError::Terminal(id.to_string()));
    }
    Ok(job)
}

fn live_owner_of(jobs: &HashMap<JobId, Job>, path: &Path) -> Option<JobId> {
    jobs.values()
        .find(|j| !j.status.is_terminal() && j.destination_path == path)
        .map(|j| j.id.clone())
}

/// Absolute http(s) URL with a host.
fn validate_url(raw: &str) -> EngineResult<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| EngineError::InvalidRequest(format!("malformed URL {raw:?}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(EngineError::InvalidRequest(format!(
                "unsupported URL scheme: {other}"
            )))
        }
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(EngineError::InvalidRequest(format!("URL has no host: {raw}")));
    }
    Ok(())
}

fn ends_with_separator(p: &Path) -> bool {
    p.as_os_str()
        .to_string_lossy()
        .ends_with(std::path::MAIN_SEPARATOR)
}

fn parent_dir(p: &Path) -> PathBuf {
    match p.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn ensure_writable_dir(dir: &Path) -> EngineResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        EngineError::InvalidRequest(format!("cannot create directory {}: {}", dir.display(), e))
    })?;
    let meta = std::fs::metadata(dir).map_err(|e| {
        EngineError::InvalidRequest(format!("cannot inspect directory {}: {}", dir.display(), e))
    })?;
    if !meta.is_dir() {
        return Err(EngineError::InvalidRequest(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    if meta.permissions().readonly() {
        return Err(EngineError::InvalidRequest(format!(
            "directory {} is not writable",
            dir.display()
        )));
    }
    Ok(())
}
