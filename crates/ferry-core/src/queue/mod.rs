//! Admission queue: priority order plus the `max_concurrent` bound.
//!
//! Pending jobs wait in a max-heap ordered by `(priority desc, enqueue order
//! asc)`. Removal and reprioritization are lazy: the `entries` map holds the
//! live `(seq, priority)` for each queued job and stale heap items are skipped
//! on pop.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::job::{JobId, JobRegistry, JobStatus, Priority, TransitionFields};

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueItem {
    job_id: JobId,
    priority: Priority,
    seq: u64,
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<QueueItem>,
    entries: HashMap<JobId, (u64, Priority)>,
    active: HashSet<JobId>,
    next_seq: u64,
    max_concurrent: usize,
}

impl QueueInner {
    fn is_live(&self, item: &QueueItem) -> bool {
        self.entries.get(&item.job_id) == Some(&(item.seq, item.priority))
    }

    /// Drop stale items once they outnumber live ones.
    fn compact(&mut self) {
        if self.heap.len() > 32 && self.heap.len() > self.entries.len() * 2 {
            let entries = &self.entries;
            self.heap
                .retain(|item| entries.get(&item.job_id) == Some(&(item.seq, item.priority)));
        }
    }
}

/// Counts reported by `AdmissionQueue::snapshot`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub active: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub max_concurrent: usize,
}

/// A job that just took a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub job_id: JobId,
    /// Pending for new jobs, Paused for resumed ones.
    pub from: JobStatus,
}

pub struct AdmissionQueue {
    inner: Mutex<QueueInner>,
}

impl AdmissionQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                max_concurrent: max_concurrent.max(1),
                ..QueueInner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `job_id` behind everything already waiting at `priority` or above.
    /// Re-enqueueing a queued job moves it to the back of its new priority.
    pub fn enqueue(&self, job_id: &str, priority: Priority) {
        let mut q = self.lock();
        let seq = q.next_seq;
        q.next_seq += 1;
        q.entries.insert(job_id.to_string(), (seq, priority));
        q.heap.push(QueueItem {
            job_id: job_id.to_string(),
            priority,
            seq,
        });
        q.compact();
    }

    /// Atomically reserve a slot for the best waiting job and move it to
    /// Admitted. Jobs whose transition fails (cancelled or paused while
    /// queued) are dropped and the next one is tried.
    pub fn try_admit(&self, registry: &JobRegistry) -> Option<Admission> {
        let mut q = self.lock();
        if q.active.len() >= q.max_concurrent {
            return None;
        }
        while let Some(item) = q.heap.pop() {
            if !q.is_live(&item) {
                continue;
            }
            q.entries.remove(&item.job_id);
            match registry.move_to(&item.job_id, JobStatus::Admitted, TransitionFields::default()) {
                Ok((from, _)) => {
                    q.active.insert(item.job_id.clone());
                    tracing::debug!(job_id = %item.job_id, priority = %item.priority, active = q.active.len(), "job admitted");
                    return Some(Admission {
                        job_id: item.job_id,
                        from,
                    });
                }
                Err(e) => {
                    tracing::debug!(job_id = %item.job_id, error = %e, "skipping queued job");
                }
            }
        }
        None
    }

    /// Change the priority of a queued job, keeping its place among equals.
    /// Returns false if the job is not waiting in the queue.
    pub fn reprioritize(&self, job_id: &str, priority: Priority) -> bool {
        let mut q = self.lock();
        let Some(&(seq, old)) = q.entries.get(job_id) else {
            return false;
        };
        if old != priority {
            q.entries.insert(job_id.to_string(), (seq, priority));
            q.heap.push(QueueItem {
                job_id: job_id.to_string(),
                priority,
                seq,
            });
            q.compact();
        }
        true
    }

    /// Forget a queued job (cancelled or paused before admission).
    pub fn remove(&self, job_id: &str) -> bool {
        self.lock().entries.remove(job_id).is_some()
    }

    /// Free the slot held by `job_id`. Returns false if it held none.
    pub fn release_slot(&self, job_id: &str) -> bool {
        let released = self.lock().active.remove(job_id);
        if released {
            tracing::debug!(job_id, "slot released");
        }
        released
    }

    pub fn set_max_concurrent(&self, max: usize) {
        self.lock().max_concurrent = max.max(1);
    }

    pub fn max_concurrent(&self) -> usize {
        self.lock().max_concurrent
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Waiting job ids in admission order.
    pub fn pending_order(&self) -> Vec<JobId> {
        let q = self.lock();
        let mut live: Vec<&QueueItem> = q.heap.iter().filter(|i| q.is_live(i)).collect();
        live.sort_by(|a, b| b.cmp(a));
        live.into_iter().map(|i| i.job_id.clone()).collect()
    }

    pub fn snapshot(&self, registry: &JobRegistry) -> QueueSnapshot {
        let (active, max_concurrent) = {
            let q = self.lock();
            (q.active.len(), q.max_concurrent)
        };
        QueueSnapshot {
            pending: registry.count(JobStatus::Pending),
            active,
            paused: registry.count(JobStatus::Paused),
            completed: registry.count(JobStatus::Completed),
            failed: registry.count(JobStatus::Failed),
            cancelled: registry.count(JobStatus::Cancelled),
            max_concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRequest;

    fn admit(q: &AdmissionQueue, reg: &JobRegistry) -> Option<JobId> {
        q.try_admit(reg).map(|a| a.job_id)
    }

    fn submit(reg: &JobRegistry, dir: &std::path::Path, name: &str) -> JobId {
        reg.create(&JobRequest::new(
            format!("https://example.com/{name}"),
            dir.join(name),
        ))
        .unwrap()
    }

    #[test]
    fn admits_by_priority_then_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let reg = JobRegistry::new();
        let q = AdmissionQueue::new(10);
        let low = submit(&reg, dir.path(), "low");
        let urgent = submit(&reg, dir.path(), "urgent");
        let normal_a = submit(&reg, dir.path(), "a");
        let normal_b = submit(&reg, dir.path(), "b");
        q.enqueue(&low, Priority::Low);
        q.enqueue(&urgent, Priority::Urgent);
        q.enqueue(&normal_a, Priority::Normal);
        q.enqueue(&normal_b, Priority::Normal);

        let order: Vec<_> = std::iter::from_fn(|| admit(&q, &reg)).collect();
        assert_eq!(order, vec![urgent, normal_a, normal_b, low]);
    }

    #[test]
    fn respects_max_concurrent() {
        let dir = tempfile::tempdir().unwrap();
        let reg = JobRegistry::new();
        let q = AdmissionQueue::new(2);
        let ids: Vec<_> = (0..5)
            .map(|i| submit(&reg, dir.path(), &format!("f{i}")))
            .collect();
        for id in &ids {
            q.enqueue(id, Priority::Normal);
        }
        assert_eq!(admit(&q, &reg).as_ref(), Some(&ids[0]));
        assert_eq!(admit(&q, &reg).as_ref(), Some(&ids[1]));
        assert_eq!(admit(&q, &reg), None);
        assert_eq!(q.active_count(), 2);
        assert_eq!(reg.count(JobStatus::Pending), 3);

        assert!(q.release_slot(&ids[0]));
        assert_eq!(admit(&q, &reg).as_ref(), Some(&ids[2]));
        assert!(!q.release_slot("unknown"));
    }

    #[test]
    fn reprioritize_keeps_seq() {
        let dir = tempfile::tempdir().unwrap();
        let reg = JobRegistry::new();
        let q = AdmissionQueue::new(1);
        let a = submit(&reg, dir.path(), "a");
        let b = submit(&reg, dir.path(), "b");
        let c = submit(&reg, dir.path(), "c");
        q.enqueue(&a, Priority::High);
        q.enqueue(&b, Priority::Low);
        q.enqueue(&c, Priority::Low);
        assert!(q.reprioritize(&c, Priority::High));
        assert!(q.reprioritize(&b, Priority::High));
        // a, b and c now share High; enqueue order decides.
        assert_eq!(q.pending_order(), vec![a, b, c]);
        assert!(!q.reprioritize("missing", Priority::Urgent));
    }

    #[test]
    fn cancelled_jobs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let reg = JobRegistry::new();
        let q = AdmissionQueue::new(1);
        let a = submit(&reg, dir.path(), "a");
        let b = submit(&reg, dir.path(), "b");
        q.enqueue(&a, Priority::Normal);
        q.enqueue(&b, Priority::Normal);
        reg.transition(&a, JobStatus::Cancelled, TransitionFields::default())
            .unwrap();
        assert_eq!(admit(&q, &reg), Some(b));
        assert_eq!(q.pending_count(), 0);
    }

    #[test]
    fn removed_jobs_are_not_admitted() {
        let dir = tempfile::tempdir().unwrap();
        let reg = JobRegistry::new();
        let q = AdmissionQueue::new(4);
        let a = submit(&reg, dir.path(), "a");
        q.enqueue(&a, Priority::Normal);
        assert!(q.remove(&a));
        assert_eq!(admit(&q, &reg), None);
        assert_eq!(reg.status(&a), Some(JobStatus::Pending));
    }

    #[test]
    fn resumed_jobs_report_paused_origin() {
        let dir = tempfile::tempdir().unwrap();
        let reg = JobRegistry::new();
        let q = AdmissionQueue::new(1);
        let a = submit(&reg, dir.path(), "a");
        reg.transition(&a, JobStatus::Paused, TransitionFields::default())
            .unwrap();
        q.enqueue(&a, Priority::Normal);
        let admission = q.try_admit(&reg).unwrap();
        assert_eq!(admission.from, JobStatus::Paused);
        assert_eq!(reg.status(&a), Some(JobStatus::Admitted));
    }

    #[test]
    fn snapshot_counts() {
        let dir = tempfile::tempdir().unwrap();
        let reg = JobRegistry::new();
        let q = AdmissionQueue::new(1);
        let a = submit(&reg, dir.path(), "a");
        let b = submit(&reg, dir.path(), "b");
        q.enqueue(&a, Priority::Normal);
        q.enqueue(&b, Priority::Normal);
        admit(&q, &reg);
        let snap = q.snapshot(&reg);
        assert_eq!(snap.pending, 1);
        assert_eq!(snap.active, 1);
        assert_eq!(snap.max_concurrent, 1);
    }
}
