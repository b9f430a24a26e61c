//! Time scheduler: job definitions that become jobs once their trigger
//! time arrives.
//!
//! A sweep marks due entries `Fired` under the lock before anything else
//! happens, so an entry can never produce two jobs however often sweeps run.
//! Fired, cancelled and failed entries stay visible for
//! [`SETTLED_RETENTION_SECS`] and are then dropped by a later sweep; the
//! history store keeps them.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::job::{JobId, JobRequest, Priority};

/// How long a settled entry stays queryable in memory.
pub const SETTLED_RETENTION_SECS: i64 = 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Pending,
    Fired,
    Cancelled,
    Failed,
}

impl ScheduleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "pending",
            ScheduleStatus::Fired => "fired",
            ScheduleStatus::Cancelled => "cancelled",
            ScheduleStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub schedule_id: String,
    pub url: String,
    pub destination_path: PathBuf,
    pub owner: String,
    pub priority: Priority,
    pub trigger_time: DateTime<Utc>,
    pub status: ScheduleStatus,
    /// Job created when the entry fired.
    pub job_id: Option<JobId>,
    /// Why job creation failed.
    pub error: Option<String>,
    /// When the entry left Pending.
    #[serde(skip)]
    pub settled_at: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    pub fn request(&self) -> JobRequest {
        JobRequest::new(self.url.clone(), self.destination_path.clone())
            .owner(self.owner.clone())
            .priority(self.priority)
    }
}

#[derive(Default)]
pub struct TimeScheduler {
    entries: Mutex<HashMap<String, ScheduleEntry>>,
}

impl TimeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ScheduleEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold `req` until `trigger_time`.
    pub fn schedule(&self, req: &JobRequest, trigger_time: DateTime<Utc>) -> ScheduleEntry {
        let entry = ScheduleEntry {
            schedule_id: uuid::Uuid::new_v4().simple().to_string(),
            url: req.url.clone(),
            destination_path: req.destination.clone(),
            owner: req.owner.clone(),
            priority: req.priority,
            trigger_time,
            status: ScheduleStatus::Pending,
            job_id: None,
            error: None,
            settled_at: None,
        };
        tracing::info!(schedule_id = %entry.schedule_id, url = %entry.url, at = %trigger_time, "scheduled");
        self.lock().insert(entry.schedule_id.clone(), entry.clone());
        entry
    }

    /// Claim every Pending entry due at `now`, marking it Fired. Entries
    /// settled more than [`SETTLED_RETENTION_SECS`] before `now` are dropped.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<ScheduleEntry> {
        let retention = chrono::Duration::seconds(SETTLED_RETENTION_SECS);
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.settled_at.map_or(true, |at| now - at <= retention));
        if entries.len() < before {
            tracing::debug!(dropped = before - entries.len(), "pruned settled schedules");
        }
        let mut due: Vec<ScheduleEntry> = entries
            .values_mut()
            .filter(|e| e.status == ScheduleStatus::Pending && e.trigger_time <= now)
            .map(|e| {
                e.status = ScheduleStatus::Fired;
                e.settled_at = Some(now);
                e.clone()
            })
            .collect();
        due.sort_by_key(|e| e.trigger_time);
        due
    }

    /// Link a fired entry to the job it produced.
    pub fn record_job(&self, schedule_id: &str, job_id: &str) -> Option<ScheduleEntry> {
        let mut entries = self.lock();
        let e = entries.get_mut(schedule_id)?;
        e.job_id = Some(job_id.to_string());
        Some(e.clone())
    }

    /// Job creation failed for a fired entry. Not retried.
    pub fn mark_failed(&self, schedule_id: &str, error: &str) -> Option<ScheduleEntry> {
        let mut entries = self.lock();
        let e = entries.get_mut(schedule_id)?;
        e.status = ScheduleStatus::Failed;
        e.error = Some(error.to_string());
        e.settled_at.get_or_insert_with(Utc::now);
        Some(e.clone())
    }

    /// Cancel an entry that has not fired yet.
    pub fn cancel(&self, schedule_id: &str) -> EngineResult<ScheduleEntry> {
        let mut entries = self.lock();
        let e = entries
            .get_mut(schedule_id)
            .ok_or_else(|| EngineError::ScheduleNotFound(schedule_id.to_string()))?;
        if e.status != ScheduleStatus::Pending {
            return Err(EngineError::ScheduleNotPending(schedule_id.to_string()));
        }
        e.status = ScheduleStatus::Cancelled;
        e.settled_at = Some(Utc::now());
        Ok(e.clone())
    }

    pub fn get(&self, schedule_id: &str) -> Option<ScheduleEntry> {
        self.lock().get(schedule_id).cloned()
    }

    /// Entries ordered by trigger time.
    pub fn list(&self) -> Vec<ScheduleEntry> {
        let mut all: Vec<_> = self.lock().values().cloned().collect();
        all.sort_by_key(|e| e.trigger_time);
        all
    }

    /// Earliest trigger among Pending entries.
    pub fn next_trigger(&self) -> Option<DateTime<Utc>> {
        self.lock()
            .values()
            .filter(|e| e.status == ScheduleStatus::Pending)
            .map(|e| e.trigger_time)
            .min()
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|e| e.status == ScheduleStatus::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn req(name: &str) -> JobRequest {
        JobRequest::new(format!("https://example.com/{name}"), format!("/tmp/{name}"))
    }

    #[test]
    fn fires_at_most_once() {
        let s = TimeScheduler::new();
        let now = Utc::now();
        let e = s.schedule(&req("a"), now - Duration::seconds(1));
        let first = s.take_due(now);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].schedule_id, e.schedule_id);
        for _ in 0..5 {
            assert!(s.take_due(now + Duration::hours(1)).is_empty());
        }
        assert_eq!(s.get(&e.schedule_id).unwrap().status, ScheduleStatus::Fired);
    }

    #[test]
    fn concurrent_sweeps_fire_once() {
        let s = std::sync::Arc::new(TimeScheduler::new());
        let now = Utc::now();
        for i in 0..20 {
            s.schedule(&req(&format!("f{i}")), now);
        }
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = s.clone();
                std::thread::spawn(move || s.take_due(now).len())
            })
            .collect();
        let fired: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(fired, 20);
    }

    #[test]
    fn future_entries_wait() {
        let s = TimeScheduler::new();
        let now = Utc::now();
        let later = s.schedule(&req("b"), now + Duration::minutes(5));
        assert!(s.take_due(now).is_empty());
        assert_eq!(s.next_trigger(), Some(later.trigger_time));
        assert_eq!(s.take_due(now + Duration::minutes(5)).len(), 1);
        assert_eq!(s.next_trigger(), None);
    }

    #[test]
    fn cancel_only_while_pending() {
        let s = TimeScheduler::new();
        let now = Utc::now();
        let a = s.schedule(&req("a"), now + Duration::minutes(1));
        let b = s.schedule(&req("b"), now);
        assert_eq!(s.cancel(&a.schedule_id).unwrap().status, ScheduleStatus::Cancelled);
        assert!(s.take_due(now + Duration::minutes(2)).iter().all(|e| e.schedule_id == b.schedule_id));
        assert!(matches!(
            s.cancel(&b.schedule_id),
            Err(EngineError::ScheduleNotPending(_))
        ));
        assert!(matches!(s.cancel("nope"), Err(EngineError::ScheduleNotFound(_))));
    }

    #[test]
    fn settled_entries_are_dropped_after_retention() {
        let s = TimeScheduler::new();
        let now = Utc::now();
        let fired = s.schedule(&req("a"), now);
        let cancelled = s.schedule(&req("b"), now + Duration::hours(3));
        let waiting = s.schedule(&req("c"), now + Duration::days(2));
        s.take_due(now);
        s.cancel(&cancelled.schedule_id).unwrap();

        let retention = Duration::seconds(SETTLED_RETENTION_SECS);
        s.take_due(now + retention);
        assert!(s.get(&fired.schedule_id).is_some());

        s.take_due(now + retention + Duration::minutes(5));
        assert!(s.get(&fired.schedule_id).is_none());
        assert!(s.get(&cancelled.schedule_id).is_none());
        assert_eq!(s.get(&waiting.schedule_id).unwrap().status, ScheduleStatus::Pending);
        assert_eq!(s.list().len(), 1);
    }

    #[test]
    fn failed_creation_is_recorded() {
        let s = TimeScheduler::new();
        let e = s.schedule(&req("a"), Utc::now());
        s.take_due(Utc::now());
        let failed = s.mark_failed(&e.schedule_id, "malformed URL").unwrap();
        assert_eq!(failed.status, ScheduleStatus::Failed);
        assert!(s.take_due(Utc::now()).is_empty());
    }
}
