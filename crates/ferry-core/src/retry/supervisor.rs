//! Drives a job's attempts: backoff between transient failures and fallback
//! through the ordered transport strategies.

use std::sync::Arc;

use crate::events::{EngineEvent, EventBus};
use crate::job::JobRegistry;
use crate::retry::{classify, ErrorKind, RetryDecision, RetryPolicy, TransferError};
use crate::transfer::{AttemptEnv, TransferOutcome, TransferRequest, Transport};

/// How a supervised transfer ended.
#[derive(Debug)]
pub enum SupervisorOutcome {
    Completed(TransferOutcome),
    /// Pause or cancel was requested.
    Aborted,
    /// Non-retryable failure, or the retry budget ran out.
    Failed { error: TransferError, attempts: u32 },
}

pub struct RetrySupervisor {
    policy: RetryPolicy,
    transports: Vec<Arc<dyn Transport>>,
    registry: Arc<JobRegistry>,
    events: EventBus,
}

impl RetrySupervisor {
    pub fn new(
        policy: RetryPolicy,
        transports: Vec<Arc<dyn Transport>>,
        registry: Arc<JobRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            policy,
            transports,
            registry,
            events,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run attempts until success, abort, or a final failure.
    ///
    /// An `Unavailable` strategy is skipped for the next one without using an
    /// attempt; the job stays on the fallback from then on.
    pub async fn run(&self, mut req: TransferRequest, env: &AttemptEnv) -> SupervisorOutcome {
        let mut strategy = 0usize;
        let mut attempt = 0u32;
        loop {
            let Some(transport) = self.transports.get(strategy) else {
                return SupervisorOutcome::Failed {
                    error: TransferError::Unavailable("no usable transport strategy".into()),
                    attempts: attempt,
                };
            };
            attempt += 1;
            tracing::info!(
                job_id = %req.job_id,
                attempt,
                transport = transport.name(),
                offset = req.resume_from,
                "attempt starting"
            );

            let error = match transport.fetch(&req, env).await {
                Ok(outcome) => return SupervisorOutcome::Completed(outcome),
                Err(TransferError::Aborted) => return SupervisorOutcome::Aborted,
                Err(e) => e,
            };
            if env.abort.is_aborted() {
                return SupervisorOutcome::Aborted;
            }

            let kind = classify(&error);
            if kind == ErrorKind::Unavailable {
                tracing::warn!(job_id = %req.job_id, transport = transport.name(), error = %error, "transport unavailable, falling back");
                attempt -= 1;
                strategy += 1;
                continue;
            }

            tracing::warn!(job_id = %req.job_id, attempt, ?kind, error = %error, "attempt failed");
            match self.policy.decide(attempt, kind) {
                RetryDecision::NoRetry => {
                    if kind != ErrorKind::Other {
                        env.checkpoints.save_on_disk().await;
                    }
                    return SupervisorOutcome::Failed {
                        error,
                        attempts: attempt,
                    };
                }
                RetryDecision::RetryAfter(delay) => {
                    let on_disk = env.checkpoints.save_on_disk().await;
                    if env.checkpoints.is_resumable() {
                        req.resume_from = on_disk;
                        req.if_range = env.checkpoints.if_range().or(req.if_range.take());
                    } else {
                        req.resume_from = 0;
                        req.if_range = None;
                    }
                    let reason = error.to_string();
                    if let Err(e) = self.registry.record_retry(&req.job_id, attempt, &reason) {
                        tracing::debug!(job_id = %req.job_id, error = %e, "retry not recorded");
                    }
                    self.events.publish(EngineEvent::Retrying {
                        job_id: req.job_id.clone(),
                        attempt,
                        delay,
                        reason,
                    });
                    tracing::info!(job_id = %req.job_id, attempt, delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = env.abort.aborted() => return SupervisorOutcome::Aborted,
                    }
                }
            }
        }
    }
}
