//! Typed engine events fanned out over a broadcast channel.
//!
//! Publishing never blocks; with no subscribers events are dropped, and a slow
//! subscriber sees `RecvError::Lagged` rather than stalling transfers.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::{JobId, JobStatus};
use crate::schedule::ScheduleStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Bounded-frequency progress; always sent once with `completed = true`.
    Progress {
        job_id: JobId,
        bytes_done: u64,
        bytes_total: u64,
        /// Bytes per second.
        rate: f64,
        completed: bool,
    },
    /// An attempt failed transiently; the next starts after `delay`.
    Retrying {
        job_id: JobId,
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    /// The server ignored the range request; the file restarted from zero.
    Restarted { job_id: JobId },
    StatusChanged {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    Completed { job_id: JobId, bytes: u64 },
    Failed { job_id: JobId, error: String },
    ScheduleChanged {
        schedule_id: String,
        status: ScheduleStatus,
        job_id: Option<JobId>,
    },
}

impl EngineEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            EngineEvent::Progress { job_id, .. }
            | EngineEvent::Retrying { job_id, .. }
            | EngineEvent::Restarted { job_id }
            | EngineEvent::StatusChanged { job_id, .. }
            | EngineEvent::Completed { job_id, .. }
            | EngineEvent::Failed { job_id, .. } => Some(job_id),
            EngineEvent::ScheduleChanged { job_id, .. } => job_id.as_deref(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineEvent::Completed { .. } | EngineEvent::Failed { .. })
    }
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Sync; safe from blocking transfer threads.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
