//! Control socket: server (during `ferry get`/`recover`) and client (for
//! `ferry pause`, `resume`, `cancel`, `status`).
//!
//! One request line per connection: `pause <id>`, `resume <id>`,
//! `cancel <id>`, `cancel-keep <id>` or `status`. The reply is `ok`,
//! `error <message>`, or for `status` one tab-separated line per job.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ferry_core::{Engine, JobSnapshot};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

pub fn socket_path(state_dir: &Path) -> PathBuf {
    state_dir.join("control.sock")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Pause(String),
    Resume(String),
    Cancel { id: String, keep: bool },
    Status,
}

impl Request {
    pub fn parse(line: &str) -> Option<Request> {
        let line = line.trim();
        if line == "status" {
            return Some(Request::Status);
        }
        let (verb, id) = line.split_once(' ')?;
        let id = id.trim();
        if id.is_empty() || id.contains(char::is_whitespace) {
            return None;
        }
        let id = id.to_string();
        match verb {
            "pause" => Some(Request::Pause(id)),
            "resume" => Some(Request::Resume(id)),
            "cancel" => Some(Request::Cancel { id, keep: false }),
            "cancel-keep" => Some(Request::Cancel { id, keep: true }),
            _ => None,
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            Request::Pause(id) => format!("pause {id}"),
            Request::Resume(id) => format!("resume {id}"),
            Request::Cancel { id, keep: false } => format!("cancel {id}"),
            Request::Cancel { id, keep: true } => format!("cancel-keep {id}"),
            Request::Status => "status".to_string(),
        }
    }
}

/// Tab-separated: id, status, priority, bytes done, bytes total, destination, url.
pub fn status_line(job: &JobSnapshot) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        job.id,
        job.status,
        job.priority,
        job.bytes_done,
        job.bytes_total,
        job.destination_path.display(),
        job.url
    )
}

/// Bind `path` (replacing a stale socket) and serve requests against `engine`.
pub fn spawn_control_listener(
    engine: Engine,
    path: impl AsRef<Path>,
) -> Result<tokio::task::JoinHandle<()>> {
    let path = path.as_ref().to_path_buf();
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("bind control socket {}", path.display()))?;
    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, &engine).await {
                            tracing::debug!("control connection: {e:#}");
                        }
                    });
                }
                Err(e) => tracing::debug!("control socket accept: {}", e),
            }
        }
    });
    Ok(handle)
}

async fn serve(stream: UnixStream, engine: &Engine) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };
    let reply = match Request::parse(&line) {
        Some(req) => answer(req, engine).await,
        None => vec![format!("error unknown request: {}", line.trim())],
    };
    for l in reply {
        write.write_all(l.as_bytes()).await?;
        write.write_all(b"\n").await?;
    }
    write.shutdown().await?;
    Ok(())
}

async fn answer(req: Request, engine: &Engine) -> Vec<String> {
    tracing::debug!(request = %req.to_line(), "control request");
    let result = match &req {
        Request::Pause(id) => engine.pause(id).await,
        Request::Resume(id) => engine.resume(id),
        Request::Cancel { id, keep } => engine.cancel(id, *keep).await,
        Request::Status => return engine.list(None).iter().map(status_line).collect(),
    };
    match result {
        Ok(()) => vec!["ok".to_string()],
        Err(e) => vec![format!("error {e}")],
    }
}

/// Send one request and collect the reply lines.
pub async fn send(socket_path: &Path, req: &Request) -> Result<Vec<String>> {
    if !socket_path.exists() {
        bail!("no running ferry process (no socket at {})", socket_path.display());
    }
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connect {}", socket_path.display()))?;
    let (read, mut write) = stream.into_split();
    write.write_all(req.to_line().as_bytes()).await?;
    write.write_all(b"\n").await?;
    let mut lines = BufReader::new(read).lines();
    let mut out = Vec::new();
    while let Some(line) = lines.next_line().await? {
        out.push(line);
    }
    Ok(out)
}

/// Whether a process is accepting on `socket_path`.
pub async fn is_live(socket_path: &Path) -> bool {
    UnixStream::connect(socket_path).await.is_ok()
}
