//! SHA-256 of finished files, computed on demand rather than inline.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

const BUF_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 of the file at `path`.
pub fn sha256_path(path: &Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Async wrapper; hashing runs on a blocking thread.
pub async fn sha256_path_async(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || sha256_path(&path)).await?
}

/// Compare a computed digest with a user-supplied one (hex, any case,
/// surrounding whitespace ignored).
pub fn digest_matches(digest: &str, expected: &str) -> bool {
    digest.eq_ignore_ascii_case(expected.trim())
}
