//! CLI for the ferry transfer engine.

mod commands;
mod control_socket;

use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use ferry_core::config;
use ferry_core::Priority;

use commands::{
    run_cancel, run_checksum, run_get, run_history, run_pause, run_probe, run_recover,
    run_resumable, run_resume, run_status, GetArgs,
};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "ferry")]
#[command(about = "ferry: resumable, scheduled, bandwidth-aware downloads", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Download one or more URLs in the foreground.
    Get {
        /// HTTP/HTTPS URLs to download.
        #[arg(required = true)]
        urls: Vec<String>,
        /// Target file or directory (default: configured download dir, else cwd).
        #[arg(long, short = 'd')]
        dest: Option<PathBuf>,
        /// low, normal, high or urgent.
        #[arg(long, short = 'p', default_value = "normal")]
        priority: Priority,
        /// Transfers allowed at once (overrides max_concurrent).
        #[arg(long, short = 'j', value_name = "N")]
        jobs: Option<usize>,
        /// Start time: RFC 3339, or HH:MM local (next occurrence).
        #[arg(long, value_parser = parse_at)]
        at: Option<DateTime<Utc>>,
        /// Owner for bandwidth profiles.
        #[arg(long, default_value = "")]
        owner: String,
    },

    /// Pause a running job of an active `ferry get`.
    Pause {
        /// Job identifier.
        id: String,
    },

    /// Resume a paused job of an active `ferry get`.
    Resume {
        /// Job identifier.
        id: String,
    },

    /// Cancel a job of an active `ferry get`.
    Cancel {
        /// Job identifier.
        id: String,
        /// Keep the partial file and checkpoint.
        #[arg(long)]
        keep: bool,
    },

    /// Show the jobs of an active `ferry get`.
    Status,

    /// List checkpoints left by interrupted transfers.
    Resumable,

    /// Continue interrupted transfers from their checkpoints (all when no ID is given).
    Recover {
        ids: Vec<String>,
        #[arg(long, short = 'j', value_name = "N")]
        jobs: Option<usize>,
    },

    /// Show recorded jobs from the history database.
    History,

    /// Probe a URL with HEAD: size, range support, suggested name.
    Probe {
        url: String,
        /// Timeout in seconds.
        #[arg(long, default_value = "15")]
        timeout: u64,
    },

    /// Compute SHA-256 of a file, or verify it against --expect.
    Checksum {
        path: PathBuf,
        #[arg(long)]
        expect: Option<String>,
    },
}

/// `--at` values: RFC 3339, or `HH:MM` for the next such local time.
fn parse_at(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    let time = NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| format!("expected RFC 3339 or HH:MM, got {s:?}"))?;
    next_local(Local::now(), time).ok_or_else(|| format!("{s} does not exist in local time"))
}

fn next_local<Tz: TimeZone>(now: DateTime<Tz>, time: NaiveTime) -> Option<DateTime<Utc>> {
    let tz = now.timezone();
    let today = now.date_naive().and_time(time);
    let candidate = tz.from_local_datetime(&today).earliest()?;
    let candidate = if candidate > now {
        candidate
    } else {
        let tomorrow = today + chrono::Duration::days(1);
        tz.from_local_datetime(&tomorrow).earliest()?
    };
    Some(candidate.with_timezone(&Utc))
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);
        let state_dir = cfg.resolve_state_dir()?;
        let socket = control_socket::socket_path(&state_dir);

        match cli.command {
            CliCommand::Get {
                urls,
                dest,
                priority,
                jobs,
                at,
                owner,
            } => {
                let args = GetArgs {
                    urls,
                    dest,
                    priority,
                    jobs,
                    at,
                    owner,
                };
                run_get(cfg, &state_dir, args).await?
            }
            CliCommand::Pause { id } => run_pause(&socket, &id).await?,
            CliCommand::Resume { id } => run_resume(&socket, &id).await?,
            CliCommand::Cancel { id, keep } => run_cancel(&socket, &id, keep).await?,
            CliCommand::Status => run_status(&socket).await?,
            CliCommand::Resumable => run_resumable(&state_dir).await?,
            CliCommand::Recover { ids, jobs } => {
                if socket.exists() && control_socket::is_live(&socket).await {
                    bail!("another ferry process is running; stop it before recovering");
                }
                run_recover(cfg, &state_dir, ids, jobs).await?
            }
            CliCommand::History => run_history(&state_dir).await?,
            CliCommand::Probe { url, timeout } => run_probe(&url, timeout).await?,
            CliCommand::Checksum { path, expect } => run_checksum(path, expect.as_deref()).await?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
