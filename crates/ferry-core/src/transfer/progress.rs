//! Progress reporting for one job: registry counters plus `Progress` events,
//! at most once per interval (and always for the final report).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::events::{EngineEvent, EventBus};
use crate::job::{JobId, JobRegistry};

#[derive(Default)]
struct RateWindow {
    last_emit: Option<Instant>,
    last_bytes: u64,
    rate: f64,
}

/// Cloneable; safe to call from async tasks and blocking threads.
#[derive(Clone)]
pub struct ProgressSink {
    job_id: JobId,
    registry: Arc<JobRegistry>,
    events: EventBus,
    interval: Duration,
    window: Arc<Mutex<RateWindow>>,
}

impl ProgressSink {
    pub fn new(job_id: JobId, registry: Arc<JobRegistry>, events: EventBus, interval: Duration) -> Self {
        Self {
            job_id,
            registry,
            events,
            interval,
            window: Arc::default(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Bytes written so far; dropped if the last report was too recent.
    pub fn report(&self, bytes_done: u64, bytes_total: u64) {
        let now = Instant::now();
        let rate = {
            let mut w = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            match w.last_emit {
                Some(t) if now.duration_since(t) < self.interval => return,
                Some(t) => {
                    let secs = now.duration_since(t).as_secs_f64();
                    w.rate = bytes_done.saturating_sub(w.last_bytes) as f64 / secs.max(1e-3);
                }
                None => w.rate = 0.0,
            }
            w.last_emit = Some(now);
            w.last_bytes = bytes_done;
            w.rate
        };
        self.emit(bytes_done, bytes_total, rate, false);
    }

    /// The file starts over from byte zero.
    pub fn restarted(&self, bytes_total: u64) {
        {
            let mut w = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            w.last_bytes = 0;
        }
        if let Err(e) = self.registry.restart_progress(&self.job_id, bytes_total) {
            tracing::debug!(job_id = %self.job_id, error = %e, "restart not recorded");
        }
        tracing::info!(job_id = %self.job_id, "range not honored, restarting from zero");
        self.events.publish(EngineEvent::Restarted {
            job_id: self.job_id.clone(),
        });
    }

    /// Final report, never throttled.
    pub fn finish(&self, bytes_done: u64, bytes_total: u64) {
        let rate = self
            .window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rate;
        self.emit(bytes_done, bytes_total, rate, true);
    }

    fn emit(&self, bytes_done: u64, bytes_total: u64, rate: f64, completed: bool) {
        if let Err(e) = self
            .registry
            .update_progress(&self.job_id, bytes_done, bytes_total, rate)
        {
            tracing::debug!(job_id = %self.job_id, error = %e, "progress not recorded");
            return;
        }
        self.events.publish(EngineEvent::Progress {
            job_id: self.job_id.clone(),
            bytes_done,
            bytes_total,
            rate,
            completed,
        });
    }
}
