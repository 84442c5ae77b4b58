use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;

use crate::codegen::models::{DiffStat, Job, JobStatus, NewJob, RequirementStatus};

/// Statuses a job may still leave. Status writes are guarded on this set so a
/// terminal row is never overwritten.
const OPEN_STATUSES: &str = "('pending', 'cloning', 'running')";

/// Thread-safe handle to the database.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<JobDb>>,
}

impl DbHandle {
    pub fn new(db: JobDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&JobDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup, CLI commands
    /// and tests only; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, JobDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// A stored event row. `kind` and `data` are kept as text; the hub owns
/// their interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub seq: u64,
    pub kind: String,
    pub data: String,
}

struct JobRow {
    id: i64,
    requirement_id: i64,
    repo_url: String,
    source_branch: String,
    target_branch: String,
    status: String,
    extra_context: Option<String>,
    prompt: Option<String>,
    error_message: Option<String>,
    commit_sha: Option<String>,
    diff_stat: String,
    cost_usd: f64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let status = self
            .status
            .parse::<JobStatus>()
            .map_err(|e| anyhow::anyhow!(e))?;
        let diff_stat: DiffStat = serde_json::from_str(&self.diff_stat)
            .with_context(|| format!("Invalid diff_stat JSON for job {}", self.id))?;
        Ok(Job {
            id: self.id,
            requirement_id: self.requirement_id,
            repo_url: self.repo_url,
            source_branch: self.source_branch,
            target_branch: self.target_branch,
            status,
            extra_context: self.extra_context,
            prompt: self.prompt,
            error_message: self.error_message,
            commit_sha: self.commit_sha,
            diff_stat,
            cost_usd: self.cost_usd,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, requirement_id, repo_url, source_branch, target_branch, status, extra_context, prompt, error_message, commit_sha, diff_stat, cost_usd, created_at, started_at, completed_at";

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        requirement_id: row.get(1)?,
        repo_url: row.get(2)?,
        source_branch: row.get(3)?,
        target_branch: row.get(4)?,
        status: row.get(5)?,
        extra_context: row.get(6)?,
        prompt: row.get(7)?,
        error_message: row.get(8)?,
        commit_sha: row.get(9)?,
        diff_stat: row.get(10)?,
        cost_usd: row.get(11)?,
        created_at: row.get(12)?,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

pub struct JobDb {
    conn: Connection,
}

impl JobDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    requirement_id INTEGER NOT NULL,
                    repo_url TEXT NOT NULL,
                    source_branch TEXT NOT NULL,
                    target_branch TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    extra_context TEXT,
                    prompt TEXT,
                    error_message TEXT,
                    commit_sha TEXT,
                    diff_stat TEXT NOT NULL DEFAULT '{}',
                    cost_usd REAL NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS requirement_status (
                    requirement_id INTEGER PRIMARY KEY,
                    status TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS job_events (
                    job_id INTEGER NOT NULL,
                    seq INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    data TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (job_id, seq)
                );

                CREATE TABLE IF NOT EXISTS event_streams (
                    job_id INTEGER PRIMARY KEY,
                    expires_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_requirement ON jobs(requirement_id);
                CREATE INDEX IF NOT EXISTS idx_event_streams_expiry ON event_streams(expires_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Jobs ────────────────────────────────────────────────────────────

    pub fn create_job(&self, new: &NewJob) -> Result<Job> {
        self.conn
            .execute(
                "INSERT INTO jobs (requirement_id, repo_url, source_branch, target_branch, extra_context)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.requirement_id,
                    new.repo_url,
                    new.source_branch,
                    new.target_branch,
                    new.extra_context
                ],
            )
            .context("Failed to insert job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.context("Job not found after insert")
    }

    /// Insert a job that is already `completed`, for changes made outside
    /// the pipeline.
    pub fn create_completed_job(
        &self,
        new: &NewJob,
        prompt: &str,
        commit_sha: Option<&str>,
    ) -> Result<Job> {
        self.conn
            .execute(
                "INSERT INTO jobs (requirement_id, repo_url, source_branch, target_branch, extra_context,
                                   status, prompt, commit_sha, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'completed', ?6, ?7, datetime('now'), datetime('now'))",
                params![
                    new.requirement_id,
                    new.repo_url,
                    new.source_branch,
                    new.target_branch,
                    new.extra_context,
                    prompt,
                    commit_sha
                ],
            )
            .context("Failed to insert completed job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                read_job_row,
            )
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    /// Jobs for a requirement, newest first, with the total count.
    pub fn list_jobs_for_requirement(
        &self,
        requirement_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Job>, i64)> {
        let total: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM jobs WHERE requirement_id = ?1",
                params![requirement_id],
                |row| row.get(0),
            )
            .context("Failed to count jobs")?;

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM jobs WHERE requirement_id = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3",
                JOB_COLUMNS
            ))
            .context("Failed to prepare list_jobs_for_requirement")?;
        let rows = stmt
            .query_map(params![requirement_id, limit, offset], read_job_row)
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok((jobs, total))
    }

    /// Move a job that is not yet terminal to `status`. Returns false when the
    /// job is missing or already terminal.
    pub fn update_status(&self, id: i64, status: JobStatus) -> Result<bool> {
        let started = if status == JobStatus::Running {
            ", started_at = datetime('now')"
        } else {
            ""
        };
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE jobs SET status = ?1{} WHERE id = ?2 AND status IN {}",
                    started, OPEN_STATUSES
                ),
                params![status.as_str(), id],
            )
            .context("Failed to update job status")?;
        Ok(changed > 0)
    }

    pub fn save_prompt(&self, id: i64, prompt: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET prompt = ?1 WHERE id = ?2",
                params![prompt, id],
            )
            .context("Failed to save prompt")?;
        Ok(())
    }

    pub fn complete_job(
        &self,
        id: i64,
        commit_sha: Option<&str>,
        diff_stat: &DiffStat,
        cost_usd: f64,
    ) -> Result<bool> {
        let diff_json = serde_json::to_string(diff_stat).context("Failed to encode diff_stat")?;
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE jobs SET status = 'completed', commit_sha = ?1, diff_stat = ?2, cost_usd = ?3,
                            completed_at = datetime('now')
                     WHERE id = ?4 AND status IN {}",
                    OPEN_STATUSES
                ),
                params![commit_sha, diff_json, cost_usd, id],
            )
            .context("Failed to complete job")?;
        Ok(changed > 0)
    }

    pub fn fail_job(
        &self,
        id: i64,
        message: &str,
        commit_sha: Option<&str>,
        cost_usd: f64,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE jobs SET status = 'failed', error_message = ?1,
                            commit_sha = COALESCE(?2, commit_sha), cost_usd = ?3,
                            completed_at = datetime('now')
                     WHERE id = ?4 AND status IN {}",
                    OPEN_STATUSES
                ),
                params![message, commit_sha, cost_usd, id],
            )
            .context("Failed to mark job failed")?;
        Ok(changed > 0)
    }

    pub fn cancel_job(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE jobs SET status = 'cancelled', completed_at = datetime('now')
                     WHERE id = ?1 AND status IN {}",
                    OPEN_STATUSES
                ),
                params![id],
            )
            .context("Failed to cancel job")?;
        Ok(changed > 0)
    }

    pub fn update_diff_stat(&self, id: i64, diff_stat: &DiffStat) -> Result<()> {
        let diff_json = serde_json::to_string(diff_stat).context("Failed to encode diff_stat")?;
        self.conn
            .execute(
                "UPDATE jobs SET diff_stat = ?1 WHERE id = ?2",
                params![diff_json, id],
            )
            .context("Failed to update diff_stat")?;
        Ok(())
    }

    // ── Requirement status ──────────────────────────────────────────────

    pub fn set_requirement_status(
        &self,
        requirement_id: i64,
        status: RequirementStatus,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO requirement_status (requirement_id, status) VALUES (?1, ?2)
                 ON CONFLICT(requirement_id) DO UPDATE SET status = excluded.status,
                                                           updated_at = datetime('now')",
                params![requirement_id, status.as_str()],
            )
            .context("Failed to set requirement status")?;
        Ok(())
    }

    pub fn get_requirement_status(&self, requirement_id: i64) -> Result<Option<RequirementStatus>> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM requirement_status WHERE requirement_id = ?1",
                params![requirement_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query requirement status")?;
        status
            .map(|s| s.parse::<RequirementStatus>().map_err(|e| anyhow::anyhow!(e)))
            .transpose()
    }

    // ── Event streams ───────────────────────────────────────────────────

    /// Append an event and return its 1-based sequence number within the job.
    /// A stream that expired at or before `now` is discarded first, so the
    /// append starts a fresh stream at 1.
    pub fn append_event(&self, job_id: i64, kind: &str, data: &str, now: i64) -> Result<u64> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let expired = tx
            .execute(
                "DELETE FROM event_streams WHERE job_id = ?1 AND expires_at <= ?2",
                params![job_id, now],
            )
            .context("Failed to drop expired stream")?;
        if expired > 0 {
            tx.execute("DELETE FROM job_events WHERE job_id = ?1", params![job_id])
                .context("Failed to delete expired events")?;
        }
        let seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM job_events WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .context("Failed to compute next event id")?;
        tx.execute(
            "INSERT INTO job_events (job_id, seq, kind, data) VALUES (?1, ?2, ?3, ?4)",
            params![job_id, seq, kind, data],
        )
        .context("Failed to insert event")?;
        tx.commit().context("Failed to commit event")?;
        Ok(seq as u64)
    }

    /// Events with `seq > after`, oldest first. Expired streams read as empty.
    pub fn events_after(&self, job_id: i64, after: u64, now: i64) -> Result<Vec<EventRow>> {
        self.query_events(
            "SELECT seq, kind, data FROM job_events e
             WHERE job_id = ?1 AND seq > ?2
               AND NOT EXISTS (SELECT 1 FROM event_streams s WHERE s.job_id = e.job_id AND s.expires_at <= ?3)
             ORDER BY seq",
            params![job_id, after as i64, now],
        )
    }

    pub fn events_page(
        &self,
        job_id: i64,
        offset: u64,
        limit: u64,
        now: i64,
    ) -> Result<Vec<EventRow>> {
        self.query_events(
            "SELECT seq, kind, data FROM job_events e
             WHERE job_id = ?1
               AND NOT EXISTS (SELECT 1 FROM event_streams s WHERE s.job_id = e.job_id AND s.expires_at <= ?4)
             ORDER BY seq LIMIT ?2 OFFSET ?3",
            params![job_id, limit as i64, offset as i64, now],
        )
    }

    fn query_events(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<EventRow>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare event query")?;
        let rows = stmt
            .query_map(args, |row| {
                let seq: i64 = row.get(0)?;
                Ok(EventRow {
                    seq: seq as u64,
                    kind: row.get(1)?,
                    data: row.get(2)?,
                })
            })
            .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?);
        }
        Ok(events)
    }

    pub fn count_events(&self, job_id: i64, now: i64) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM job_events e
                 WHERE job_id = ?1
                   AND NOT EXISTS (SELECT 1 FROM event_streams s WHERE s.job_id = e.job_id AND s.expires_at <= ?2)",
                params![job_id, now],
                |row| row.get(0),
            )
            .context("Failed to count events")?;
        Ok(count as u64)
    }

    pub fn set_stream_expiry(&self, job_id: i64, expires_at: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO event_streams (job_id, expires_at) VALUES (?1, ?2)
                 ON CONFLICT(job_id) DO UPDATE SET expires_at = excluded.expires_at",
                params![job_id, expires_at],
            )
            .context("Failed to set stream expiry")?;
        Ok(())
    }

    /// Delete every stream whose expiry has passed. Returns the number of
    /// streams removed.
    pub fn purge_expired_streams(&self, now: i64) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "DELETE FROM job_events WHERE job_id IN
               (SELECT job_id FROM event_streams WHERE expires_at <= ?1)",
            params![now],
        )
        .context("Failed to delete expired events")?;
        let streams = tx
            .execute(
                "DELETE FROM event_streams WHERE expires_at <= ?1",
                params![now],
            )
            .context("Failed to delete expired streams")?;
        tx.commit().context("Failed to commit purge")?;
        Ok(streams)
    }
}
