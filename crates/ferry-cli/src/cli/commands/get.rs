//! `ferry get` – run the engine in the foreground until its jobs settle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Local, Utc};
use ferry_core::config::FerryConfig;
use ferry_core::store::SqliteHistory;
use ferry_core::{Engine, EngineEvent, JobRequest, JobStatus, Priority};
use tokio::sync::broadcast::error::RecvError;

use super::{mib, short_id};
use crate::cli::control_socket;

#[derive(Debug)]
pub struct GetArgs {
    pub urls: Vec<String>,
    pub dest: Option<PathBuf>,
    pub priority: Priority,
    pub jobs: Option<usize>,
    pub at: Option<DateTime<Utc>>,
    pub owner: String,
}

pub async fn run_get(mut cfg: FerryConfig, state_dir: &Path, args: GetArgs) -> Result<()> {
    if let Some(n) = args.jobs {
        cfg.max_concurrent = n.max(1);
    }
    let dest = match args.dest.or_else(|| cfg.download_dir.clone()) {
        Some(d) => d,
        None => std::env::current_dir()?,
    };
    if args.urls.len() > 1 && !dest.is_dir() {
        bail!("several URLs need a directory destination, {} is not one", dest.display());
    }

    let engine = foreground_engine(cfg, state_dir).await?;
    let mut accepted = 0usize;
    for url in &args.urls {
        let req = JobRequest::new(url.as_str(), &dest)
            .owner(args.owner.as_str())
            .priority(args.priority);
        match args.at {
            Some(at) => {
                let entry = engine.schedule(&req, at);
                println!(
                    "scheduled {} for {}  {}",
                    short_id(&entry.schedule_id),
                    at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                    url
                );
                accepted += 1;
            }
            None => match engine.submit(&req) {
                Ok(id) => {
                    println!("queued {}  {}", id, url);
                    accepted += 1;
                }
                Err(e) => eprintln!("skipped {url}: {e}"),
            },
        }
    }
    if accepted == 0 {
        engine.shutdown().await;
        bail!("nothing to download");
    }
    run_foreground(&engine).await
}

/// Engine with SQLite history when the database opens.
pub(super) async fn foreground_engine(cfg: FerryConfig, state_dir: &Path) -> Result<Engine> {
    let mut builder = Engine::builder(cfg).state_dir(state_dir);
    match SqliteHistory::open_at(SqliteHistory::default_path(state_dir)).await {
        Ok(history) => builder = builder.history(Arc::new(history)),
        Err(e) => tracing::warn!("history disabled: {e:#}"),
    }
    builder.build()
}

/// Serve the control socket and render events until every job settles or
/// Ctrl-C; then shut the engine down and report.
pub(super) async fn run_foreground(engine: &Engine) -> Result<()> {
    let socket = control_socket::socket_path(engine.state_dir());
    let listener = match control_socket::spawn_control_listener(engine.clone(), &socket) {
        Ok(handle) => {
            tracing::debug!(path = %socket.display(), "control socket listening");
            Some(handle)
        }
        Err(e) => {
            tracing::warn!("control socket unavailable: {e:#}");
            None
        }
    };
    let renderer = tokio::spawn(render_events(engine.subscribe()));

    let interrupted = tokio::select! {
        _ = settle(engine) => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        println!("\nInterrupted; saving progress...");
    }
    engine.shutdown().await;

    if let Some(handle) = listener {
        handle.abort();
        let _ = std::fs::remove_file(&socket);
    }
    renderer.abort();
    summarize(engine)
}

/// Idle with no paused job. Paused jobs keep the process up so
/// `ferry resume` can reach them.
async fn settle(engine: &Engine) {
    let mut events = engine.subscribe();
    loop {
        engine.wait_idle().await;
        let paused = engine
            .list(None)
            .iter()
            .filter(|j| j.status == JobStatus::Paused)
            .count();
        if paused == 0 {
            return;
        }
        println!("{paused} job(s) paused; `ferry resume <id>` or `ferry cancel <id>` (Ctrl-C to stop)");
        loop {
            match events.recv().await {
                Ok(EngineEvent::StatusChanged {
                    from: JobStatus::Paused,
                    ..
                }) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => break,
                Err(RecvError::Closed) => return,
            }
        }
    }
}

async fn render_events(mut events: tokio::sync::broadcast::Receiver<EngineEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(ev) => ev,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        match event {
            EngineEvent::Progress {
                job_id,
                bytes_done,
                bytes_total,
                rate,
                completed: false,
            } => {
                let pct = if bytes_total > 0 {
                    format!("{:.1}%", bytes_done as f64 * 100.0 / bytes_total as f64)
                } else {
                    "?".to_string()
                };
                println!(
                    "  {}  {:.1} / {:.1} MiB ({})  {:.2} MiB/s",
                    short_id(&job_id),
                    mib(bytes_done),
                    mib(bytes_total),
                    pct,
                    rate / 1_048_576.0
                );
            }
            EngineEvent::Retrying {
                job_id,
                attempt,
                delay,
                reason,
            } => eprintln!(
                "  {}  attempt {} failed ({}); retrying in {:.1}s",
                short_id(&job_id),
                attempt,
                reason,
                delay.as_secs_f64()
            ),
            EngineEvent::Restarted { job_id } => {
                eprintln!("  {}  server ignored the range; restarting", short_id(&job_id))
            }
            EngineEvent::Completed { job_id, bytes } => {
                println!("  {}  done ({:.1} MiB)", short_id(&job_id), mib(bytes))
            }
            EngineEvent::Failed { job_id, error } => {
                eprintln!("  {}  failed: {}", short_id(&job_id), error)
            }
            EngineEvent::ScheduleChanged {
                schedule_id,
                status,
                job_id,
            } => println!(
                "  schedule {} {}{}",
                short_id(&schedule_id),
                status,
                job_id.map(|id| format!(" -> {id}")).unwrap_or_default()
            ),
            _ => {}
        }
    }
}

fn summarize(engine: &Engine) -> Result<()> {
    let jobs = engine.list(None);
    let count = |s: JobStatus| jobs.iter().filter(|j| j.status == s).count();
    let (completed, failed, paused) = (
        count(JobStatus::Completed),
        count(JobStatus::Failed),
        count(JobStatus::Paused),
    );
    println!("{completed} completed, {failed} failed, {paused} paused");
    for job in jobs.iter().filter(|j| j.status == JobStatus::Completed) {
        println!("  {}", job.destination_path.display());
    }
    if paused > 0 {
        println!("Continue paused transfers with `ferry recover`.");
    }
    if failed > 0 {
        bail!("{failed} job(s) failed");
    }
    Ok(())
}
