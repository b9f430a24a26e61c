//! Admission loop and the per-job task.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::Inner;
use crate::checkpoint::{Checkpoint, CheckpointWriter};
use crate::control::AbortHandle;
use crate::events::EngineEvent;
use crate::job::{unix_timestamp, JobSnapshot, JobStatus, TransitionFields};
use crate::retry::{SupervisorOutcome, TransferError};
use crate::storage;
use crate::transfer::{AttemptEnv, ProgressSink, TransferOutcome, TransferRequest};
use crate::url_model;

/// Start a task for every job the queue admits; sleep until woken.
pub(super) async fn admission_loop(inner: Arc<Inner>) {
    loop {
        let woken = inner.wake.notified();
        while let Some(admission) = inner.queue.try_admit(&inner.registry) {
            if let Some(job) = inner.registry.get(&admission.job_id) {
                inner.announce(admission.from, &job);
            }
            // Registered before the task exists so cancel always finds it.
            let handle = inner.control.register(&admission.job_id);
            let task_inner = Arc::clone(&inner);
            inner
                .tasks
                .spawn(run_job(task_inner, admission.job_id, handle));
        }
        tokio::select! {
            _ = woken => {}
            _ = inner.shutdown.cancelled() => break,
        }
    }
    tracing::debug!("admission loop stopped");
}

async fn run_job(inner: Arc<Inner>, job_id: String, handle: AbortHandle) {
    drive(&inner, &job_id, &handle).await;
    inner.control.unregister(&job_id);
    inner.queue.release_slot(&job_id);
    handle.mark_finished();
    inner.wake.notify_one();
    inner.idle.notify_waiters();
}

/// Take one admitted job to Completed, Failed or wherever pause/cancel put it.
async fn drive(inner: &Inner, job_id: &str, handle: &AbortHandle) {
    let Some(job) = inner.registry.get(job_id) else {
        return;
    };
    if handle.is_aborted() {
        return;
    }

    let record = match inner.checkpoints.load(job_id).await {
        Ok(Some(cp)) if cp.url == job.url && cp.destination_path == job.destination_path => cp,
        Ok(Some(_)) => {
            tracing::warn!(job_id, "checkpoint belongs to another transfer, starting over");
            fresh_record(&job)
        }
        Ok(None) => fresh_record(&job),
        Err(e) => {
            tracing::warn!(job_id, error = %e, "checkpoint unreadable, starting over");
            fresh_record(&job)
        }
    };
    let resume_from = record.bytes_confirmed;
    let if_range = record.if_range().map(str::to_string);

    if let Err(e) = inner.set_status(
        job_id,
        JobStatus::Transferring,
        TransitionFields::bytes(resume_from, record.bytes_total),
    ) {
        // Paused or cancelled between admission and start.
        tracing::debug!(job_id, error = %e, "job not started");
        return;
    }

    let cfg = &inner.config;
    let env = AttemptEnv {
        abort: handle.clone(),
        progress: ProgressSink::new(
            job_id.to_string(),
            Arc::clone(&inner.registry),
            inner.events.clone(),
            cfg.progress_interval(),
        ),
        governor: Arc::clone(&inner.governor),
        checkpoints: CheckpointWriter::new(
            inner.checkpoints.clone(),
            record,
            cfg.checkpoint_every_bytes,
            Duration::from_secs(cfg.checkpoint_every_secs),
        ),
        settings: inner.settings.clone(),
    };
    let url = match &inner.links {
        Some(links) => tokio::select! {
            url = links.resolve(&job.url) => url,
            _ = handle.aborted() => return,
        },
        None => job.url.clone(),
    };
    let req = TransferRequest {
        job_id: job_id.to_string(),
        url,
        owner: job.owner.clone(),
        part_path: storage::part_path(&job.destination_path),
        resume_from,
        if_range,
    };
    if resume_from > 0 {
        tracing::info!(job_id, offset = resume_from, "resuming from checkpoint");
    }

    match inner.supervisor.run(req, &env).await {
        SupervisorOutcome::Completed(outcome) => complete(inner, &job, outcome, &env).await,
        SupervisorOutcome::Aborted => {
            if inner.registry.status(job_id) == Some(JobStatus::Paused) {
                let kept = env.checkpoints.save_on_disk().await;
                tracing::info!(job_id, bytes = kept, "transfer stopped for pause");
            }
        }
        SupervisorOutcome::Failed { error, attempts } => {
            tracing::error!(job_id, attempts, error = %error, "job failed");
            fail(inner, job_id, &error);
        }
    }
}

fn fresh_record(job: &JobSnapshot) -> Checkpoint {
    Checkpoint {
        job_id: job.id.clone(),
        url: job.url.clone(),
        destination_path: job.destination_path.clone(),
        bytes_confirmed: 0,
        bytes_total: 0,
        updated_at: unix_timestamp(),
        owner: job.owner.clone(),
        priority: job.priority,
        etag: None,
        last_modified: None,
    }
}

/// Move the finished part file into place and mark the job Completed.
async fn complete(inner: &Inner, job: &JobSnapshot, outcome: TransferOutcome, env: &AttemptEnv) {
    let job_id = job.id.as_str();
    let bytes = outcome.bytes_written;
    if let Err(e) = inner.registry.begin_finalize(job_id) {
        // Pause or cancel landed after the last chunk; the part file stays.
        tracing::info!(job_id, error = %e, "finished transfer not moved into place");
        if inner.registry.status(job_id) == Some(JobStatus::Paused) {
            env.checkpoints.save_on_disk().await;
        }
        return;
    }
    let part = storage::part_path(&job.destination_path);
    let dest = final_destination(inner, job, outcome.meta.content_type.as_deref());

    if let Err(e) = storage::finalize(&part, &dest).await {
        fail(inner, job_id, &TransferError::Storage(e));
        return;
    }
    if let Err(e) = inner.checkpoints.clear(job_id).await {
        tracing::warn!(job_id, error = %e, "failed to remove checkpoint");
    }
    env.progress.finish(bytes, bytes);

    match inner.set_status(job_id, JobStatus::Completed, TransitionFields::bytes(bytes, bytes)) {
        Ok(_) => {
            tracing::info!(job_id, bytes, dest = %dest.display(), "job completed");
            inner.events.publish(EngineEvent::Completed {
                job_id: job_id.to_string(),
                bytes,
            });
        }
        Err(e) => tracing::warn!(job_id, error = %e, "finished transfer not recorded"),
    }
}

/// Destination with an extension inferred from `Content-Type` when the name
/// has none and nothing else owns the new name.
fn final_destination(inner: &Inner, job: &JobSnapshot, content_type: Option<&str>) -> std::path::PathBuf {
    let dest = job.destination_path.clone();
    if !inner.config.infer_extension {
        return dest;
    }
    let Some(candidate) = url_model::with_inferred_extension(&dest, content_type) else {
        return dest;
    };
    if Path::new(&candidate).exists() {
        return dest;
    }
    match inner.registry.set_destination(&job.id, candidate.clone()) {
        Ok(()) => candidate,
        Err(e) => {
            tracing::debug!(job_id = %job.id, error = %e, "extension not applied");
            dest
        }
    }
}

fn fail(inner: &Inner, job_id: &str, error: &TransferError) {
    let message = error.to_string();
    match inner.set_status(job_id, JobStatus::Failed, TransitionFields::error(message.clone())) {
        Ok(_) => inner.events.publish(EngineEvent::Failed {
            job_id: job_id.to_string(),
            error: message,
        }),
        Err(e) => tracing::debug!(job_id, error = %e, "failure not recorded"),
    }
}
