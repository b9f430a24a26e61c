//! SQLite history (sqlx): one row per job and per schedule entry, upserted.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};

use super::HistoryStore;
use crate::job::{unix_timestamp, Job, JobSnapshot, JobStatus, Priority};
use crate::schedule::{ScheduleEntry, ScheduleStatus};

#[derive(Clone)]
pub struct SqliteHistory {
    pool: Pool<Sqlite>,
}

impl SqliteHistory {
    /// `<state_dir>/history.db`.
    pub fn default_path(state_dir: &Path) -> PathBuf {
        state_dir.join("history.db")
    }

    /// Open (or create) the database at `path`, creating parent directories.
    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .with_context(|| format!("open history db {}", path.display()))?;
        let db = SqliteHistory { pool };
        db.migrate().await?;
        Ok(db)
    }

    #[cfg(test)]
    pub(crate) async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = SqliteHistory { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                destination TEXT NOT NULL,
                owner TEXT NOT NULL,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                bytes_total INTEGER NOT NULL,
                bytes_done INTEGER NOT NULL,
                retry_count INTEGER NOT NULL,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                ended_at INTEGER,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                destination TEXT NOT NULL,
                owner TEXT NOT NULL,
                priority TEXT NOT NULL,
                trigger_time TEXT NOT NULL,
                status TEXT NOT NULL,
                job_id TEXT,
                error TEXT,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_job(&self, job: &JobSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, url, destination, owner, status, priority,
                bytes_total, bytes_done, retry_count, last_error,
                created_at, started_at, ended_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(id) DO UPDATE SET
                destination = excluded.destination,
                status = excluded.status,
                priority = excluded.priority,
                bytes_total = excluded.bytes_total,
                bytes_done = excluded.bytes_done,
                retry_count = excluded.retry_count,
                last_error = excluded.last_error,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&job.id)
        .bind(&job.url)
        .bind(job.destination_path.to_string_lossy().into_owned())
        .bind(&job.owner)
        .bind(job.status.as_str())
        .bind(job.priority.as_str())
        .bind(job.bytes_total as i64)
        .bind(job.bytes_done as i64)
        .bind(job.retry_count as i64)
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.ended_at)
        .bind(unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_schedule(&self, e: &ScheduleEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (
                id, url, destination, owner, priority, trigger_time,
                status, job_id, error, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                job_id = excluded.job_id,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&e.schedule_id)
        .bind(&e.url)
        .bind(e.destination_path.to_string_lossy().into_owned())
        .bind(&e.owner)
        .bind(e.priority.as_str())
        .bind(e.trigger_time.to_rfc3339())
        .bind(e.status.as_str())
        .bind(&e.job_id)
        .bind(&e.error)
        .bind(unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recorded jobs, newest first.
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT id, url, destination, owner, status, priority, bytes_total,
                   bytes_done, retry_count, last_error, created_at, started_at, ended_at
            FROM jobs
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            let priority: String = row.get("priority");
            let destination: String = row.get("destination");
            out.push(Job {
                id: row.get("id"),
                url: row.get("url"),
                destination_path: PathBuf::from(destination),
                owner: row.get("owner"),
                status: status.parse::<JobStatus>().map_err(anyhow::Error::msg)?,
                priority: priority.parse::<Priority>().map_err(anyhow::Error::msg)?,
                bytes_total: row.get::<i64, _>("bytes_total") as u64,
                bytes_done: row.get::<i64, _>("bytes_done") as u64,
                transfer_rate: 0.0,
                finalizing: false,
                retry_count: row.get::<i64, _>("retry_count") as u32,
                last_error: row.get("last_error"),
                created_at: row.get("created_at"),
                started_at: row.get("started_at"),
                ended_at: row.get("ended_at"),
            });
        }
        Ok(out)
    }

    /// Recorded schedule entries by trigger time.
    pub async fn list_schedules(&self) -> Result<Vec<ScheduleEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, url, destination, owner, priority, trigger_time, status, job_id, error
            FROM schedules
            ORDER BY trigger_time ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let priority: String = row.get("priority");
            let trigger: String = row.get("trigger_time");
            let status: String = row.get("status");
            let destination: String = row.get("destination");
            out.push(ScheduleEntry {
                schedule_id: row.get("id"),
                url: row.get("url"),
                destination_path: PathBuf::from(destination),
                owner: row.get("owner"),
                priority: priority.parse::<Priority>().map_err(anyhow::Error::msg)?,
                trigger_time: DateTime::parse_from_rfc3339(&trigger)?.with_timezone(&Utc),
                status: parse_schedule_status(&status)?,
                job_id: row.get("job_id"),
                error: row.get("error"),
                settled_at: None,
            });
        }
        Ok(out)
    }
}

fn parse_schedule_status(s: &str) -> Result<ScheduleStatus> {
    Ok(match s {
        "pending" => ScheduleStatus::Pending,
        "fired" => ScheduleStatus::Fired,
        "cancelled" => ScheduleStatus::Cancelled,
        "failed" => ScheduleStatus::Failed,
        other => anyhow::bail!("unknown schedule status: {other}"),
    })
}

#[async_trait]
impl HistoryStore for SqliteHistory {
    async fn record_job_created(&self, job: &JobSnapshot) -> Result<()> {
        self.upsert_job(job).await
    }

    async fn record_job_updated(&self, job: &JobSnapshot) -> Result<()> {
        self.upsert_job(job).await
    }

    async fn record_schedule_created(&self, entry: &ScheduleEntry) -> Result<()> {
        self.upsert_schedule(entry).await
    }

    async fn record_schedule_updated(&self, entry: &ScheduleEntry) -> Result<()> {
        self.upsert_schedule(entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRequest;
    use crate::schedule::TimeScheduler;

    fn job(id: &str, status: JobStatus) -> Job {
        Job {
            id: id.into(),
            url: format!("https://example.com/{id}"),
            destination_path: PathBuf::from(format!("/tmp/{id}")),
            owner: "alice".into(),
            status,
            priority: Priority::High,
            bytes_total: 100,
            bytes_done: 40,
            transfer_rate: 12.5,
            finalizing: false,
            retry_count: 1,
            last_error: Some("HTTP 503".into()),
            created_at: 1_700_000_000,
            started_at: Some(1_700_000_001),
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn job_upsert_roundtrip() {
        let db = SqliteHistory::open_memory().await.unwrap();
        db.record_job_created(&job("a", JobStatus::Pending)).await.unwrap();
        let mut done = job("a", JobStatus::Completed);
        done.bytes_done = 100;
        done.ended_at = Some(1_700_000_050);
        db.record_job_updated(&done).await.unwrap();

        let jobs = db.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        let j = &jobs[0];
        assert_eq!(j.status, JobStatus::Completed);
        assert_eq!(j.bytes_done, 100);
        assert_eq!(j.priority, Priority::High);
        assert_eq!(j.last_error.as_deref(), Some("HTTP 503"));
        assert_eq!(j.ended_at, Some(1_700_000_050));
        assert_eq!(j.transfer_rate, 0.0);
    }

    #[tokio::test]
    async fn schedule_upsert_roundtrip() {
        let db = SqliteHistory::open_memory().await.unwrap();
        let sched = TimeScheduler::new();
        let entry = sched.schedule(
            &JobRequest::new("https://example.com/n.iso", "/tmp/n.iso"),
            Utc::now(),
        );
        db.record_schedule_created(&entry).await.unwrap();
        sched.take_due(Utc::now());
        let fired = sched.record_job(&entry.schedule_id, "job-1").unwrap();
        db.record_schedule_updated(&fired).await.unwrap();

        let rows = db.list_schedules().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ScheduleStatus::Fired);
        assert_eq!(rows[0].job_id.as_deref(), Some("job-1"));
        assert_eq!(rows[0].trigger_time.timestamp(), entry.trigger_time.timestamp());
    }

    #[tokio::test]
    async fn open_at_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = SqliteHistory::default_path(&dir.path().join("state"));
        let db = SqliteHistory::open_at(&path).await.unwrap();
        db.record_job_created(&job("b", JobStatus::Failed)).await.unwrap();
        assert!(path.exists());
        assert_eq!(db.list_jobs().await.unwrap().len(), 1);
    }
}
