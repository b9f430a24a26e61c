//! History persistence: an optional durable record of jobs and schedules.
//!
//! The engine never reads this back to make decisions; it only reports.
//! Writes go through `HistoryRecorder`, which queues them to one background
//! task so callers never wait and records land in order.

mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::job::JobSnapshot;
use crate::schedule::ScheduleEntry;

pub use sqlite::SqliteHistory;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn record_job_created(&self, job: &JobSnapshot) -> anyhow::Result<()>;
    async fn record_job_updated(&self, job: &JobSnapshot) -> anyhow::Result<()>;
    async fn record_schedule_created(&self, entry: &ScheduleEntry) -> anyhow::Result<()>;
    async fn record_schedule_updated(&self, entry: &ScheduleEntry) -> anyhow::Result<()>;
}

/// Accepts everything, stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

#[async_trait]
impl HistoryStore for NoopStore {
    async fn record_job_created(&self, _job: &JobSnapshot) -> anyhow::Result<()> {
        Ok(())
    }

    async fn record_job_updated(&self, _job: &JobSnapshot) -> anyhow::Result<()> {
        Ok(())
    }

    async fn record_schedule_created(&self, _entry: &ScheduleEntry) -> anyhow::Result<()> {
        Ok(())
    }

    async fn record_schedule_updated(&self, _entry: &ScheduleEntry) -> anyhow::Result<()> {
        Ok(())
    }
}

enum Record {
    JobCreated(JobSnapshot),
    JobUpdated(JobSnapshot),
    ScheduleCreated(ScheduleEntry),
    ScheduleUpdated(ScheduleEntry),
}

/// Fire-and-forget front for a `HistoryStore`. Failures are logged at warn.
#[derive(Clone)]
pub struct HistoryRecorder {
    tx: mpsc::UnboundedSender<Record>,
}

impl HistoryRecorder {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn HistoryStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Record>();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let (what, result) = match &record {
                    Record::JobCreated(j) => ("job created", store.record_job_created(j).await),
                    Record::JobUpdated(j) => ("job updated", store.record_job_updated(j).await),
                    Record::ScheduleCreated(e) => {
                        ("schedule created", store.record_schedule_created(e).await)
                    }
                    Record::ScheduleUpdated(e) => {
                        ("schedule updated", store.record_schedule_updated(e).await)
                    }
                };
                if let Err(e) = result {
                    tracing::warn!(record = what, error = %e, "history write failed");
                }
            }
        });
        Self { tx }
    }

    fn send(&self, record: Record) {
        if self.tx.send(record).is_err() {
            tracing::debug!("history writer gone, record dropped");
        }
    }

    pub fn job_created(&self, job: JobSnapshot) {
        self.send(Record::JobCreated(job));
    }

    pub fn job_updated(&self, job: JobSnapshot) {
        self.send(Record::JobUpdated(job));
    }

    pub fn schedule_created(&self, entry: ScheduleEntry) {
        self.send(Record::ScheduleCreated(entry));
    }

    pub fn schedule_updated(&self, entry: ScheduleEntry) {
        self.send(Record::ScheduleUpdated(entry));
    }
}
