//! Partial-file lifecycle: `<dest>.part` while transferring, renamed on success.
//!
//! A part file is either opened fresh (truncated) or reopened for append at a
//! confirmed offset; any bytes past that offset are cut off first so the file
//! never holds unconfirmed data ahead of the write position.

use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::io::AsyncSeekExt;

/// Suffix appended to the destination while the transfer is in progress.
pub const PART_SUFFIX: &str = ".part";

/// `file.iso` -> `file.iso.part`.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut o = dest.as_os_str().to_owned();
    o.push(PART_SUFFIX);
    PathBuf::from(o)
}

/// Size of the file at `path`, 0 if it does not exist.
pub fn on_disk_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn open_options(offset: u64) -> std::fs::OpenOptions {
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true);
    if offset == 0 {
        opts.truncate(true);
    }
    opts
}

fn check_offset(path: &Path, len: u64, offset: u64) -> io::Result<()> {
    if len < offset {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "{} holds {} bytes, cannot resume at {}",
                path.display(),
                len,
                offset
            ),
        ));
    }
    Ok(())
}

/// Open `part` for writing at `offset` (0 = fresh file).
pub async fn open_part(part: &Path, offset: u64) -> io::Result<tokio::fs::File> {
    let mut file = tokio::fs::OpenOptions::from(open_options(offset))
        .open(part)
        .await?;
    if offset > 0 {
        check_offset(part, file.metadata().await?.len(), offset)?;
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
    }
    Ok(file)
}

/// Blocking twin of `open_part` for transports running on a blocking thread.
pub fn open_part_blocking(part: &Path, offset: u64) -> io::Result<std::fs::File> {
    let mut file = open_options(offset).open(part)?;
    if offset > 0 {
        check_offset(part, file.metadata()?.len(), offset)?;
        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;
    }
    Ok(file)
}

/// Move the finished part file into place.
pub async fn finalize(part: &Path, dest: &Path) -> io::Result<()> {
    tokio::fs::rename(part, dest).await
}

/// Delete the part file for `dest`; missing is fine.
pub async fn remove_part(dest: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(part_path(dest)).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
