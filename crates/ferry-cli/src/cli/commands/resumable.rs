//! `ferry resumable` – checkpoints left by interrupted transfers.

use std::path::Path;

use anyhow::Result;
use ferry_core::checkpoint::ResumeCoordinator;

use super::mib;

pub async fn run_resumable(state_dir: &Path) -> Result<()> {
    let checkpoints = ResumeCoordinator::new(state_dir).list_resumable().await?;
    if checkpoints.is_empty() {
        println!("No interrupted transfers.");
        return Ok(());
    }
    println!("{:<36} {:>10} {:>10}  {}", "ID", "DONE MiB", "TOTAL MiB", "DESTINATION");
    for cp in checkpoints {
        let total = if cp.bytes_total > 0 {
            format!("{:.1}", mib(cp.bytes_total))
        } else {
            "-".to_string()
        };
        println!(
            "{:<36} {:>10.1} {:>10}  {}",
            cp.job_id,
            mib(cp.bytes_confirmed),
            total,
            cp.destination_path.display()
        );
    }
    println!("Continue with `ferry recover [ID...]`.");
    Ok(())
}
