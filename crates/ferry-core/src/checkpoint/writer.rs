//! Per-job checkpoint cadence: every N bytes or T seconds, whichever first.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{Checkpoint, ResumeCoordinator};
use crate::storage;

struct WriterState {
    record: Checkpoint,
    resumable: bool,
    saved_bytes: u64,
    saved_at: Instant,
}

/// Shared by every attempt of one job. Cloning shares the cadence state.
#[derive(Clone)]
pub struct CheckpointWriter {
    coordinator: ResumeCoordinator,
    every_bytes: u64,
    every: Duration,
    state: Arc<Mutex<WriterState>>,
}

impl CheckpointWriter {
    /// `record` carries the job identity; byte counts are filled in per save.
    /// A record that already confirms bytes came from a resumable response.
    pub fn new(
        coordinator: ResumeCoordinator,
        record: Checkpoint,
        every_bytes: u64,
        every: Duration,
    ) -> Self {
        let saved_bytes = record.bytes_confirmed;
        Self {
            coordinator,
            every_bytes: every_bytes.max(1),
            every,
            state: Arc::new(Mutex::new(WriterState {
                resumable: saved_bytes > 0,
                record,
                saved_bytes,
                saved_at: Instant::now(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record what the server said about this response. A non-resumable
    /// response invalidates any earlier checkpoint.
    pub async fn begin_response(
        &self,
        resumable: bool,
        start: u64,
        total: u64,
        etag: Option<String>,
        last_modified: Option<String>,
    ) {
        if let Some(job_id) = self.note_response(resumable, start, total, etag, last_modified) {
            if let Err(e) = self.coordinator.clear(&job_id).await {
                tracing::warn!(job_id = %job_id, error = %e, "failed to drop stale checkpoint");
            }
        }
    }

    /// `begin_response` for transports running on a blocking thread.
    pub fn begin_response_blocking(
        &self,
        resumable: bool,
        start: u64,
        total: u64,
        etag: Option<String>,
        last_modified: Option<String>,
    ) {
        if let Some(job_id) = self.note_response(resumable, start, total, etag, last_modified) {
            if let Err(e) = self.coordinator.clear_blocking(&job_id) {
                tracing::warn!(job_id = %job_id, error = %e, "failed to drop stale checkpoint");
            }
        }
    }

    /// Update the record; returns the job id when its checkpoint must go.
    fn note_response(
        &self,
        resumable: bool,
        start: u64,
        total: u64,
        etag: Option<String>,
        last_modified: Option<String>,
    ) -> Option<String> {
        let mut st = self.lock();
        st.resumable = resumable;
        st.record.bytes_total = total;
        st.record.etag = etag;
        st.record.last_modified = last_modified;
        st.saved_bytes = start;
        st.saved_at = Instant::now();
        (!resumable).then(|| st.record.job_id.clone())
    }

    pub fn is_resumable(&self) -> bool {
        self.lock().resumable
    }

    /// `If-Range` validator of the last response, for the next attempt.
    pub fn if_range(&self) -> Option<String> {
        self.lock().record.if_range().map(str::to_string)
    }

    /// Whether a save is due at `bytes_done`. The caller flushes its file
    /// before saving so the record never runs ahead of the disk.
    pub fn due(&self, bytes_done: u64) -> bool {
        let st = self.lock();
        st.resumable
            && bytes_done > st.saved_bytes
            && (bytes_done - st.saved_bytes >= self.every_bytes || st.saved_at.elapsed() >= self.every)
    }

    fn next_record(&self, bytes_done: u64) -> Option<Checkpoint> {
        let mut st = self.lock();
        if !st.resumable || bytes_done == 0 {
            return None;
        }
        st.saved_bytes = bytes_done;
        st.saved_at = Instant::now();
        st.record.bytes_confirmed = bytes_done;
        Some(st.record.clone())
    }

    /// Save `bytes_done` as confirmed. Failures are logged, not fatal.
    pub async fn save(&self, bytes_done: u64) {
        if let Some(cp) = self.next_record(bytes_done) {
            if let Err(e) = self.coordinator.save(&cp).await {
                tracing::warn!(job_id = %cp.job_id, error = %e, "checkpoint save failed");
            }
        }
    }

    pub fn save_blocking(&self, bytes_done: u64) {
        if let Some(cp) = self.next_record(bytes_done) {
            if let Err(e) = self.coordinator.save_blocking(&cp) {
                tracing::warn!(job_id = %cp.job_id, error = %e, "checkpoint save failed");
            }
        }
    }

    /// Save whatever the part file holds now (after a failed attempt).
    pub async fn save_on_disk(&self) -> u64 {
        let part = storage::part_path(&self.lock().record.destination_path);
        let on_disk = storage::on_disk_len(&part);
        self.save(on_disk).await;
        on_disk
    }
}
