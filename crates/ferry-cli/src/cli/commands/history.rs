//! `ferry history` – jobs and schedules recorded in the history database.

use std::path::Path;

use anyhow::Result;
use ferry_core::store::SqliteHistory;

use super::short_id;

pub async fn run_history(state_dir: &Path) -> Result<()> {
    let path = SqliteHistory::default_path(state_dir);
    if !path.exists() {
        println!("No history yet.");
        return Ok(());
    }
    let history = SqliteHistory::open_at(&path).await?;
    let jobs = history.list_jobs().await?;
    if jobs.is_empty() {
        println!("No jobs recorded.");
    } else {
        println!("{:<8} {:<12} {:<8} {:>12}  {}", "ID", "STATE", "PRIO", "BYTES", "URL");
        for j in &jobs {
            println!(
                "{:<8} {:<12} {:<8} {:>12}  {}",
                short_id(&j.id),
                j.status,
                j.priority,
                j.bytes_done,
                j.url
            );
            if let Some(err) = &j.last_error {
                println!("         error: {err}");
            }
        }
    }

    let schedules = history.list_schedules().await?;
    if !schedules.is_empty() {
        println!();
        println!("{:<8} {:<10} {:<25}  {}", "SCHEDULE", "STATE", "TRIGGER", "URL");
        for s in schedules {
            println!(
                "{:<8} {:<10} {:<25}  {}",
                short_id(&s.schedule_id),
                s.status,
                s.trigger_time.to_rfc3339(),
                s.url
            );
        }
    }
    Ok(())
}
