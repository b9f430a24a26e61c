//! Resume coordinator: one JSON checkpoint per job under `<state>/checkpoints`.
//!
//! Files are written to `<id>.json.tmp` and renamed over `<id>.json`, so a
//! reader sees either the previous or the new record. On load the confirmed
//! byte count is checked against the part file on disk and the smaller value
//! wins.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::job::{unix_timestamp, JobId, Priority};
use crate::storage;

mod writer;

pub use writer::CheckpointWriter;

/// Persisted record of how far a transfer got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: JobId,
    pub url: String,
    pub destination_path: PathBuf,
    /// Bytes flushed to the part file when this record was written.
    pub bytes_confirmed: u64,
    /// 0 while unknown.
    pub bytes_total: u64,
    pub updated_at: i64,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub priority: Priority,
    /// Validators sent back as `If-Range` so a changed file restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl Checkpoint {
    pub fn part_path(&self) -> PathBuf {
        storage::part_path(&self.destination_path)
    }

    /// Value for `If-Range`: a strong ETag, else Last-Modified.
    pub fn if_range(&self) -> Option<&str> {
        self.etag
            .as_deref()
            .filter(|e| !e.starts_with("W/"))
            .or(self.last_modified.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct ResumeCoordinator {
    dir: PathBuf,
}

impl ResumeCoordinator {
    /// Checkpoints live in `state_dir/checkpoints`.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("checkpoints"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }

    fn tmp_path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.json.tmp"))
    }

    fn stamped(cp: &Checkpoint) -> Checkpoint {
        Checkpoint {
            updated_at: unix_timestamp(),
            ..cp.clone()
        }
    }

    /// Write `cp` atomically.
    pub async fn save(&self, cp: &Checkpoint) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(&Self::stamped(cp)).map_err(io::Error::other)?;
        let tmp = self.tmp_path_for(&cp.job_id);
        let mut f = tokio::fs::File::create(&tmp).await?;
        f.write_all(&json).await?;
        f.sync_all().await?;
        drop(f);
        tokio::fs::rename(&tmp, self.path_for(&cp.job_id)).await?;
        tracing::trace!(job_id = %cp.job_id, bytes = cp.bytes_confirmed, "checkpoint saved");
        Ok(())
    }

    /// Blocking twin of `save` for transports on a blocking thread.
    pub fn save_blocking(&self, cp: &Checkpoint) -> io::Result<()> {
        use std::io::Write;
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(&Self::stamped(cp)).map_err(io::Error::other)?;
        let tmp = self.tmp_path_for(&cp.job_id);
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(&json)?;
        f.sync_all()?;
        drop(f);
        std::fs::rename(&tmp, self.path_for(&cp.job_id))?;
        tracing::trace!(job_id = %cp.job_id, bytes = cp.bytes_confirmed, "checkpoint saved");
        Ok(())
    }

    /// Checkpoint for `job_id` with `bytes_confirmed` clamped to the part file
    /// size. `None` if there is no (readable) checkpoint.
    pub async fn load(&self, job_id: &str) -> io::Result<Option<Checkpoint>> {
        let data = match tokio::fs::read(self.path_for(job_id)).await {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(parse_and_verify(job_id, &data))
    }

    /// Delete the checkpoint; missing is fine.
    pub async fn clear(&self, job_id: &str) -> io::Result<()> {
        for path in [self.path_for(job_id), self.tmp_path_for(job_id)] {
            match tokio::fs::remove_file(&path).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn clear_blocking(&self, job_id: &str) -> io::Result<()> {
        for path in [self.path_for(job_id), self.tmp_path_for(job_id)] {
            match std::fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }

    /// Checkpoints that can still be resumed, oldest update first. A
    /// checkpoint whose part file is gone is deleted rather than listed.
    pub async fn list_resumable(&self) -> io::Result<Vec<Checkpoint>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(job_id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let Some(cp) = self.load(&job_id).await? else {
                continue;
            };
            if !tokio::fs::try_exists(cp.part_path()).await.unwrap_or(false) {
                tracing::info!(job_id = %cp.job_id, "part file gone, dropping checkpoint");
                self.clear(&cp.job_id).await?;
                continue;
            }
            out.push(cp);
        }
        out.sort_by_key(|cp| cp.updated_at);
        Ok(out)
    }
}

fn parse_and_verify(job_id: &str, data: &[u8]) -> Option<Checkpoint> {
    let mut cp: Checkpoint = match serde_json::from_slice(data) {
        Ok(cp) => cp,
        Err(e) => {
            tracing::warn!(job_id, error = %e, "ignoring unreadable checkpoint");
            return None;
        }
    };
    let on_disk = storage::on_disk_len(&cp.part_path());
    if on_disk < cp.bytes_confirmed {
        tracing::info!(
            job_id,
            recorded = cp.bytes_confirmed,
            on_disk,
            "part file shorter than checkpoint, trusting disk"
        );
        cp.bytes_confirmed = on_disk;
    }
    Some(cp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dir: &Path, id: &str, confirmed: u64) -> Checkpoint {
        Checkpoint {
            job_id: id.to_string(),
            url: "https://example.com/big.iso".into(),
            destination_path: dir.join(format!("{id}.iso")),
            bytes_confirmed: confirmed,
            bytes_total: 1000,
            updated_at: 0,
            owner: "alice".into(),
            priority: Priority::High,
            etag: Some("\"abc\"".into()),
            last_modified: None,
        }
    }

    #[tokio::test]
    async fn save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let rc = ResumeCoordinator::new(dir.path());
        let cp = sample(dir.path(), "j1", 300);
        std::fs::write(cp.part_path(), vec![0u8; 300]).unwrap();
        rc.save(&cp).await.unwrap();
        assert!(!rc.tmp_path_for("j1").exists());

        let loaded = rc.load("j1").await.unwrap().unwrap();
        assert_eq!(loaded.bytes_confirmed, 300);
        assert_eq!(loaded.priority, Priority::High);
        assert!(loaded.updated_at > 0);

        rc.clear("j1").await.unwrap();
        assert!(rc.load("j1").await.unwrap().is_none());
        rc.clear("j1").await.unwrap();
    }

    #[tokio::test]
    async fn load_trusts_smaller_disk_size() {
        let dir = tempfile::tempdir().unwrap();
        let rc = ResumeCoordinator::new(dir.path());
        let cp = sample(dir.path(), "j2", 500);
        std::fs::write(cp.part_path(), vec![0u8; 120]).unwrap();
        rc.save_blocking(&cp).unwrap();
        assert_eq!(rc.load("j2").await.unwrap().unwrap().bytes_confirmed, 120);

        std::fs::remove_file(cp.part_path()).unwrap();
        assert_eq!(rc.load("j2").await.unwrap().unwrap().bytes_confirmed, 0);
    }

    #[tokio::test]
    async fn corrupt_checkpoint_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let rc = ResumeCoordinator::new(dir.path());
        std::fs::create_dir_all(rc.dir()).unwrap();
        std::fs::write(rc.path_for("bad"), b"{not json").unwrap();
        assert!(rc.load("bad").await.unwrap().is_none());
        assert!(rc.list_resumable().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_resumable_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let rc = ResumeCoordinator::new(dir.path());
        assert!(rc.list_resumable().await.unwrap().is_empty());
        for id in ["a", "b"] {
            let cp = sample(dir.path(), id, 10);
            std::fs::write(cp.part_path(), vec![1u8; 10]).unwrap();
            rc.save(&cp).await.unwrap();
        }
        std::fs::write(rc.tmp_path_for("c"), b"partial").unwrap();
        let mut ids: Vec<_> = rc
            .list_resumable()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.job_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn checkpoint_without_part_file_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let rc = ResumeCoordinator::new(dir.path());
        let cp = sample(dir.path(), "gone", 64);
        std::fs::write(cp.part_path(), vec![7u8; 64]).unwrap();
        rc.save(&cp).await.unwrap();
        assert_eq!(rc.list_resumable().await.unwrap().len(), 1);

        std::fs::remove_file(cp.part_path()).unwrap();
        assert!(rc.list_resumable().await.unwrap().is_empty());
        assert!(!rc.path_for("gone").exists());
    }

    #[test]
    fn if_range_prefers_strong_etag() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = sample(dir.path(), "x", 0);
        assert_eq!(cp.if_range(), Some("\"abc\""));
        cp.etag = Some("W/\"weak\"".into());
        cp.last_modified = Some("Wed, 21 Oct 2015 07:28:00 GMT".into());
        assert_eq!(cp.if_range(), Some("Wed, 21 Oct 2015 07:28:00 GMT"));
        cp.last_modified = None;
        assert_eq!(cp.if_range(), None);
    }
}
