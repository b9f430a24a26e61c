//! `ferry pause|resume|cancel|status` – requests to a running `ferry get`.

use std::path::Path;

use anyhow::{bail, Result};

use super::mib;
use crate::cli::control_socket::{self, Request};

async fn request(socket: &Path, req: Request) -> Result<()> {
    let reply = control_socket::send(socket, &req).await?;
    match reply.first().map(String::as_str) {
        Some("ok") => Ok(()),
        Some(line) => bail!("{}", line.strip_prefix("error ").unwrap_or(line)),
        None => bail!("no reply from the running ferry process"),
    }
}

pub async fn run_pause(socket: &Path, id: &str) -> Result<()> {
    request(socket, Request::Pause(id.to_string())).await?;
    println!("Paused job {id}");
    Ok(())
}

pub async fn run_resume(socket: &Path, id: &str) -> Result<()> {
    request(socket, Request::Resume(id.to_string())).await?;
    println!("Resumed job {id}");
    Ok(())
}

pub async fn run_cancel(socket: &Path, id: &str, keep: bool) -> Result<()> {
    request(
        socket,
        Request::Cancel {
            id: id.to_string(),
            keep,
        },
    )
    .await?;
    if keep {
        println!("Cancelled job {id} (partial file kept)");
    } else {
        println!("Cancelled job {id}");
    }
    Ok(())
}

pub async fn run_status(socket: &Path) -> Result<()> {
    let lines = control_socket::send(socket, &Request::Status).await?;
    if lines.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!(
        "{:<36} {:<12} {:<8} {:>16}  {}",
        "ID", "STATE", "PRIO", "MiB", "DESTINATION"
    );
    for line in lines {
        let f: Vec<&str> = line.split('\t').collect();
        if f.len() < 7 {
            continue;
        }
        let done: u64 = f[3].parse().unwrap_or(0);
        let total: u64 = f[4].parse().unwrap_or(0);
        let size = if total > 0 {
            format!("{:.1}/{:.1}", mib(done), mib(total))
        } else {
            format!("{:.1}/?", mib(done))
        };
        println!("{:<36} {:<12} {:<8} {:>16}  {}", f[0], f[1], f[2], size, f[5]);
    }
    Ok(())
}
