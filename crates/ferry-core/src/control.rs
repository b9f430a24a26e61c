//! Stop signals for in-flight jobs.
//!
//! Each admitted job registers an `AbortHandle`. Pause and cancel both trip
//! the same token; the reason tells the job task which status to land in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::job::JobId;

/// Why a job was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Pause,
    Cancel { preserve_partial: bool },
}

const REASON_NONE: u8 = 0;
const REASON_PAUSE: u8 = 1;
const REASON_CANCEL: u8 = 2;
const REASON_CANCEL_PRESERVE: u8 = 3;

/// Cloneable stop signal handed to the transfer path.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    token: CancellationToken,
    reason: Arc<AtomicU8>,
    /// Tripped by the job task once it stopped touching the part file.
    done: CancellationToken,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// First reason wins; later requests only re-trip the token.
    pub fn abort(&self, reason: AbortReason) {
        let code = match reason {
            AbortReason::Pause => REASON_PAUSE,
            AbortReason::Cancel {
                preserve_partial: false,
            } => REASON_CANCEL,
            AbortReason::Cancel {
                preserve_partial: true,
            } => REASON_CANCEL_PRESERVE,
        };
        let _ = self
            .reason
            .compare_exchange(REASON_NONE, code, Ordering::AcqRel, Ordering::Acquire);
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        match self.reason.load(Ordering::Acquire) {
            REASON_PAUSE => Some(AbortReason::Pause),
            REASON_CANCEL => Some(AbortReason::Cancel {
                preserve_partial: false,
            }),
            REASON_CANCEL_PRESERVE => Some(AbortReason::Cancel {
                preserve_partial: true,
            }),
            _ => None,
        }
    }

    /// Resolves once `abort` has been called.
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }

    pub fn mark_finished(&self) {
        self.done.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once the job task has exited.
    pub async fn finished(&self) {
        self.done.cancelled().await
    }
}

/// Job id -> abort handle for every job holding a slot.
#[derive(Default)]
pub struct JobControl {
    jobs: Mutex<HashMap<JobId, AbortHandle>>,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, AbortHandle>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a newly admitted job and return its handle.
    pub fn register(&self, job_id: &str) -> AbortHandle {
        let handle = AbortHandle::new();
        self.lock().insert(job_id.to_string(), handle.clone());
        handle
    }

    pub fn get(&self, job_id: &str) -> Option<AbortHandle> {
        self.lock().get(job_id).cloned()
    }

    pub fn unregister(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    /// Signal a running job. Returns false if it is not registered.
    pub fn request_abort(&self, job_id: &str, reason: AbortReason) -> bool {
        match self.lock().get(job_id) {
            Some(handle) => {
                handle.abort(reason);
                true
            }
            None => false,
        }
    }

    /// Trip every registered handle (engine shutdown).
    pub fn abort_all(&self, reason: AbortReason) {
        for handle in self.lock().values() {
            handle.abort(reason);
        }
    }

    pub fn is_registered(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }
}
