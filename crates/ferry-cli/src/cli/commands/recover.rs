//! `ferry recover [ID...]` – continue interrupted transfers.

use std::path::Path;

use anyhow::{bail, Result};
use ferry_core::config::FerryConfig;

use super::get::{foreground_engine, run_foreground};

pub async fn run_recover(
    mut cfg: FerryConfig,
    state_dir: &Path,
    ids: Vec<String>,
    jobs: Option<usize>,
) -> Result<()> {
    if let Some(n) = jobs {
        cfg.max_concurrent = n.max(1);
    }
    let engine = foreground_engine(cfg, state_dir).await?;
    let available = engine.resumable().await?;

    let wanted: Vec<String> = if ids.is_empty() {
        available.iter().map(|cp| cp.job_id.clone()).collect()
    } else {
        for id in &ids {
            if !available.iter().any(|cp| &cp.job_id == id) {
                eprintln!("no checkpoint for {id}");
            }
        }
        ids.into_iter()
            .filter(|id| available.iter().any(|cp| &cp.job_id == id))
            .collect()
    };
    if wanted.is_empty() {
        engine.shutdown().await;
        if available.is_empty() {
            println!("Nothing to recover.");
            return Ok(());
        }
        bail!("none of the given jobs has a checkpoint");
    }

    for id in &wanted {
        match engine.resume_from_checkpoint(id).await {
            Ok(id) => println!("recovering {id}"),
            Err(e) => eprintln!("cannot recover {id}: {e}"),
        }
    }
    run_foreground(&engine).await
}
