//! The orchestration engine: job submission API over the registry, queue,
//! supervisor, scheduler and governor.
//!
//! Two background tasks run per engine: the admission loop, which starts a
//! job task whenever a slot frees up, and the schedule sweep. Job tasks own
//! their part file while they run; cancel waits for the task to stop before
//! touching the file.

mod builder;
mod run;
mod sweep;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bandwidth::{BandwidthGovernor, BandwidthProfile};
use crate::checkpoint::{Checkpoint, ResumeCoordinator};
use crate::config::FerryConfig;
use crate::control::{AbortReason, JobControl};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::job::{
    JobFilter, JobId, JobRegistry, JobRequest, JobSnapshot, JobStatus, Priority, TransitionFields,
};
use crate::queue::{AdmissionQueue, QueueSnapshot};
use crate::retry::RetrySupervisor;
use crate::schedule::{ScheduleEntry, TimeScheduler};
use crate::storage;
use crate::store::HistoryRecorder;
use crate::transfer::{ShareLinkResolver, TransferSettings};

pub use builder::EngineBuilder;

pub(crate) struct Inner {
    config: FerryConfig,
    state_dir: PathBuf,
    settings: TransferSettings,
    /// Share-link rewriting; `None` when disabled in config.
    links: Option<ShareLinkResolver>,
    registry: Arc<JobRegistry>,
    queue: AdmissionQueue,
    control: JobControl,
    supervisor: RetrySupervisor,
    checkpoints: ResumeCoordinator,
    scheduler: TimeScheduler,
    governor: Arc<BandwidthGovernor>,
    events: EventBus,
    history: HistoryRecorder,
    /// Something may be admissible.
    wake: Notify,
    /// A schedule was added or cancelled.
    schedules_changed: Notify,
    /// A job or schedule settled.
    idle: Notify,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Cloneable handle; clones drive the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn builder(config: FerryConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Create a Pending job and queue it for admission.
    pub fn submit(&self, req: &JobRequest) -> EngineResult<JobId> {
        self.inner.submit(req)
    }

    pub fn status(&self, job_id: &str) -> EngineResult<JobSnapshot> {
        self.inner
            .registry
            .get(job_id)
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))
    }

    /// Jobs of `owner` (every job when `None`), oldest first.
    pub fn list(&self, owner: Option<&str>) -> Vec<JobSnapshot> {
        let filter = match owner {
            Some(o) => JobFilter::owner(o),
            None => JobFilter::default(),
        };
        self.inner.registry.list(&filter)
    }

    pub fn list_filtered(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        self.inner.registry.list(filter)
    }

    /// Cancel a live job. The part file is removed unless `preserve_partial`
    /// is set and a checkpoint makes it resumable. Returns once any running
    /// attempt has stopped.
    pub async fn cancel(&self, job_id: &str, preserve_partial: bool) -> EngineResult<()> {
        let reason = AbortReason::Cancel { preserve_partial };
        let job = self.inner.set_status(job_id, JobStatus::Cancelled, TransitionFields::default())?;
        self.inner.queue.remove(job_id);
        self.inner.stop_task(job_id, reason).await;
        self.inner
            .discard_partial(job_id, &job.destination_path, preserve_partial)
            .await;
        tracing::info!(job_id, preserve_partial, "job cancelled");
        self.inner.idle.notify_waiters();
        Ok(())
    }

    /// Pause a live job, keeping its part file and checkpoint. Returns once
    /// any running attempt has stopped.
    pub async fn pause(&self, job_id: &str) -> EngineResult<()> {
        self.inner.set_status(job_id, JobStatus::Paused, TransitionFields::default())?;
        self.inner.queue.remove(job_id);
        self.inner.stop_task(job_id, AbortReason::Pause).await;
        tracing::info!(job_id, "job paused");
        self.inner.idle.notify_waiters();
        Ok(())
    }

    /// Queue a Paused job for admission again; it resumes from its checkpoint.
    pub fn resume(&self, job_id: &str) -> EngineResult<()> {
        let job = self.status(job_id)?;
        if job.status != JobStatus::Paused {
            return Err(EngineError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: JobStatus::Admitted,
            });
        }
        self.inner.queue.enqueue(job_id, job.priority);
        self.inner.wake.notify_one();
        tracing::info!(job_id, "job queued for resume");
        Ok(())
    }

    /// Change the admission priority of a job that is still waiting.
    pub fn reprioritize(&self, job_id: &str, priority: Priority) -> EngineResult<()> {
        let job = self.status(job_id)?;
        if !self.inner.queue.reprioritize(job_id, priority) {
            return Err(EngineError::InvalidRequest(format!(
                "job {job_id} is {} and no longer waiting for admission",
                job.status
            )));
        }
        self.inner.registry.set_priority(job_id, priority)?;
        tracing::debug!(job_id, %priority, "job reprioritized");
        Ok(())
    }

    /// Hold `req` until `trigger_time`; it is submitted by the sweep.
    pub fn schedule(&self, req: &JobRequest, trigger_time: DateTime<Utc>) -> ScheduleEntry {
        let entry = self.inner.scheduler.schedule(req, trigger_time);
        self.inner.history.schedule_created(entry.clone());
        self.inner.publish_schedule(&entry);
        self.inner.schedules_changed.notify_one();
        entry
    }

    pub fn cancel_schedule(&self, schedule_id: &str) -> EngineResult<ScheduleEntry> {
        let entry = self.inner.scheduler.cancel(schedule_id)?;
        self.inner.history.schedule_updated(entry.clone());
        self.inner.publish_schedule(&entry);
        self.inner.schedules_changed.notify_one();
        self.inner.idle.notify_waiters();
        Ok(entry)
    }

    pub fn schedules(&self) -> Vec<ScheduleEntry> {
        self.inner.scheduler.list()
    }

    pub fn schedule_status(&self, schedule_id: &str) -> EngineResult<ScheduleEntry> {
        self.inner
            .scheduler
            .get(schedule_id)
            .ok_or_else(|| EngineError::ScheduleNotFound(schedule_id.to_string()))
    }

    /// Submit every entry due at `now`. The sweep task calls this on its own;
    /// an entry fires at most once however often it runs.
    pub fn fire_due_schedules(&self, now: DateTime<Utc>) -> Vec<ScheduleEntry> {
        self.inner.fire_due(now)
    }

    /// Checkpoints on disk, including ones left by an earlier process.
    pub async fn resumable(&self) -> EngineResult<Vec<Checkpoint>> {
        Ok(self.inner.checkpoints.list_resumable().await?)
    }

    /// Re-create a job from a checkpoint left by an earlier process and queue
    /// it; the transfer continues from the confirmed offset.
    pub async fn resume_from_checkpoint(&self, job_id: &str) -> EngineResult<JobId> {
        let cp = self
            .inner
            .checkpoints
            .load(job_id)
            .await?
            .ok_or_else(|| EngineError::NoCheckpoint(job_id.to_string()))?;
        let id = self.inner.registry.adopt(&cp, &cp.owner, cp.priority)?;
        self.inner.after_create(&id, cp.priority);
        tracing::info!(job_id = %id, offset = cp.bytes_confirmed, "job recovered from checkpoint");
        Ok(id)
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.inner.queue.snapshot(&self.inner.registry)
    }

    /// Admission order of the jobs still waiting.
    pub fn pending_order(&self) -> Vec<JobId> {
        self.inner.queue.pending_order()
    }

    pub fn set_max_concurrent(&self, max: usize) {
        self.inner.queue.set_max_concurrent(max);
        self.inner.wake.notify_one();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Install a bandwidth profile for `owner`; running jobs pick it up
    /// within a second.
    pub fn set_bandwidth_profile(&self, owner: &str, profile: BandwidthProfile) {
        self.inner.governor.set_profile(owner, profile);
    }

    pub fn config(&self) -> &FerryConfig {
        &self.inner.config
    }

    pub fn state_dir(&self) -> &Path {
        &self.inner.state_dir
    }

    /// Resolves when no job is waiting or running and no schedule is
    /// pending. Paused jobs do not keep the engine busy.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Pause every running job (keeping checkpoints), stop the background
    /// tasks and wait for job tasks to exit. Waiting jobs stay Pending.
    pub async fn shutdown(&self) {
        let running: Vec<JobId> = self
            .list(None)
            .into_iter()
            .filter(|j| j.status.is_active())
            .map(|j| j.id)
            .collect();
        for id in running {
            if let Err(e) = self.pause(&id).await {
                tracing::debug!(job_id = %id, error = %e, "not paused at shutdown");
            }
        }
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        tracing::info!("engine stopped");
    }
}

impl Inner {
    fn submit(&self, req: &JobRequest) -> EngineResult<JobId> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::InvalidRequest("engine is shutting down".into()));
        }
        let id = self.registry.create(req)?;
        self.after_create(&id, req.priority);
        tracing::info!(job_id = %id, url = %req.url, priority = %req.priority, "job submitted");
        Ok(id)
    }

    fn after_create(&self, job_id: &str, priority: Priority) {
        if let Some(job) = self.registry.get(job_id) {
            self.history.job_created(job);
        }
        self.queue.enqueue(job_id, priority);
        self.wake.notify_one();
    }

    /// Transition through the registry, then report it.
    fn set_status(
        &self,
        job_id: &str,
        to: JobStatus,
        fields: TransitionFields,
    ) -> EngineResult<JobSnapshot> {
        let (from, job) = self.registry.move_to(job_id, to, fields)?;
        self.announce(from, &job);
        Ok(job)
    }

    fn announce(&self, from: JobStatus, job: &JobSnapshot) {
        self.events.publish(EngineEvent::StatusChanged {
            job_id: job.id.clone(),
            from,
            to: job.status,
        });
        self.history.job_updated(job.clone());
    }

    fn publish_schedule(&self, entry: &ScheduleEntry) {
        self.events.publish(EngineEvent::ScheduleChanged {
            schedule_id: entry.schedule_id.clone(),
            status: entry.status,
            job_id: entry.job_id.clone(),
        });
    }

    /// Signal the job task, if one runs, and wait for it to let go of the
    /// part file.
    async fn stop_task(&self, job_id: &str, reason: AbortReason) {
        if let Some(handle) = self.control.get(job_id) {
            handle.abort(reason);
            handle.finished().await;
        }
    }

    /// Drop the part file and checkpoint of a cancelled job, unless the
    /// caller wants the partial kept and a checkpoint makes it resumable.
    async fn discard_partial(&self, job_id: &str, dest: &Path, preserve_partial: bool) {
        if preserve_partial {
            match self.checkpoints.load(job_id).await {
                Ok(Some(_)) => {
                    tracing::info!(job_id, "partial file kept for later recovery");
                    return;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(job_id, error = %e, "checkpoint unreadable"),
            }
        }
        if let Err(e) = storage::remove_part(dest).await {
            tracing::warn!(job_id, error = %e, "failed to remove part file");
        }
        if let Err(e) = self.checkpoints.clear(job_id).await {
            tracing::warn!(job_id, error = %e, "failed to remove checkpoint");
        }
    }

    fn is_idle(&self) -> bool {
        self.registry.count(JobStatus::Pending) == 0
            && self.registry.count(JobStatus::Admitted) == 0
            && self.registry.count(JobStatus::Transferring) == 0
            && self.queue.pending_count() == 0
            && self.scheduler.pending_count() == 0
    }

    fn fire_due(&self, now: DateTime<Utc>) -> Vec<ScheduleEntry> {
        let mut fired = Vec::new();
        for entry in self.scheduler.take_due(now) {
            let settled = match self.submit(&entry.request()) {
                Ok(job_id) => self.scheduler.record_job(&entry.schedule_id, &job_id),
                Err(e) => {
                    tracing::warn!(schedule_id = %entry.schedule_id, error = %e, "scheduled job not created");
                    self.scheduler.mark_failed(&entry.schedule_id, &e.to_string())
                }
            };
            let entry = settled.unwrap_or(entry);
            tracing::info!(schedule_id = %entry.schedule_id, status = %entry.status, "schedule fired");
            self.history.schedule_updated(entry.clone());
            self.publish_schedule(&entry);
            fired.push(entry);
        }
        if !fired.is_empty() {
            self.idle.notify_waiters();
        }
        fired
    }
}
