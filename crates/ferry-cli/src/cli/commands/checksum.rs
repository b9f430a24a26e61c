//! `ferry checksum` – SHA-256 of a file, optionally verified.

use std::path::PathBuf;

use anyhow::{bail, Result};
use ferry_core::checksum;

pub async fn run_checksum(path: PathBuf, expect: Option<&str>) -> Result<()> {
    let digest = checksum::sha256_path_async(path.clone()).await?;
    println!("{}  {}", digest, path.display());
    if let Some(expected) = expect {
        if !checksum::digest_matches(&digest, expected) {
            bail!("checksum mismatch: expected {expected}");
        }
        println!("OK");
    }
    Ok(())
}
