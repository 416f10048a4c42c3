//! Durable SQLite queue backing the job runtime.
//!
//! # Schema
//! - `jobs`: pending and running work, keyed by job id.
//! - `dead_jobs`: jobs that exhausted their retry budget.
//!
//! # SQLite settings
//! Applied at open: WAL, synchronous=FULL, foreign_keys=ON. PRAGMA
//! integrity_check runs at open; returns an error if it fails. Rows left in
//! `running` by a previous process are recovered to `queued` at open, so a
//! crash mid-job yields a re-run rather than a lost job.

use crate::job::Job;
use bk_protocol::JobStatsSnapshot;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A job that exhausted its retries, as kept in the dead-letter table.
#[derive(Debug, Clone)]
pub struct DeadJob {
    pub id: String,
    pub job_type: String,
    pub queue: String,
    pub payload: Vec<u8>,
    pub retry_count: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

/// Error type for queue storage operations.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    IntegrityCheckFailed(String),
    InvalidData(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {}", e),
            StoreError::IntegrityCheckFailed(s) => write!(f, "Integrity check failed: {}", s),
            StoreError::InvalidData(s) => write!(f, "Invalid data: {}", s),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

/// The durable queue for a single runtime instance. Owned by the dispatcher
/// task; all access is single-threaded.
pub struct JobStore {
    conn: Connection,
}

impl JobStore {
    /// Open (or create) the queue at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_conn(Connection::open(path)?)
    }

    /// In-memory queue for tests: durable semantics, no file.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> Result<Self, StoreError> {
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        apply_schema(&conn)?;
        let mut store = JobStore { conn };
        store.recover_orphans()?;
        Ok(store)
    }

    /// Return `running` rows left behind by a crashed process to `queued`.
    fn recover_orphans(&mut self) -> Result<usize, StoreError> {
        let recovered = self
            .conn
            .execute("UPDATE jobs SET state = 'queued' WHERE state = 'running'", [])?;
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Intake
    // -----------------------------------------------------------------------

    /// Insert a job. With a `singleton_key`, the insert is a no-op (returns
    /// false) while another `queued` job carries the same key; a `running`
    /// job does not block, so a handler may re-enqueue its own successor.
    pub fn insert(&mut self, job: &Job, singleton_key: Option<&str>) -> Result<bool, StoreError> {
        let timeout_ms = i64::try_from(job.timeout.as_millis())
            .map_err(|_| StoreError::InvalidData("timeout out of range".to_owned()))?;
        let inserted = self.conn.execute(
            "INSERT INTO jobs
                 (id, job_type, queue, payload, state, run_at, retry_count,
                  max_retries, timeout_ms, created_at, last_error, singleton_key)
             SELECT ?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?7, ?8, ?9, NULL, ?10
             WHERE ?10 IS NULL
                OR NOT EXISTS (
                    SELECT 1 FROM jobs WHERE singleton_key = ?10 AND state = 'queued'
                )",
            params![
                job.id,
                job.job_type,
                job.queue,
                job.payload,
                job.run_at.timestamp_millis(),
                job.retry_count,
                job.max_retries,
                timeout_ms,
                job.created_at.timestamp_millis(),
                singleton_key,
            ],
        )?;
        Ok(inserted == 1)
    }

    // -----------------------------------------------------------------------
    // Leasing
    // -----------------------------------------------------------------------

    /// Lease the next due job on `queue`: the oldest `queued` row whose
    /// `run_at` has passed is flipped to `running` and returned.
    pub fn next_due(&mut self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let job = self
            .conn
            .query_row(
                "SELECT id, job_type, queue, payload, run_at, retry_count,
                        max_retries, timeout_ms, created_at, last_error
                 FROM jobs
                 WHERE queue = ?1 AND state = 'queued' AND run_at <= ?2
                 ORDER BY run_at ASC, rowid ASC
                 LIMIT 1",
                params![queue, now.timestamp_millis()],
                map_job,
            )
            .optional()?;
        if let Some(job) = &job {
            self.conn.execute(
                "UPDATE jobs SET state = 'running' WHERE id = ?1",
                params![job.id],
            )?;
        }
        Ok(job)
    }

    // -----------------------------------------------------------------------
    // Outcomes
    // -----------------------------------------------------------------------

    /// Success: the job is removed.
    pub fn complete(&mut self, id: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Failure with budget left: back to `queued` with a later `run_at`.
    pub fn schedule_retry(
        &mut self,
        id: &str,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE jobs
             SET state = 'queued', run_at = ?2, retry_count = retry_count + 1,
                 last_error = ?3
             WHERE id = ?1",
            params![id, run_at.timestamp_millis(), error],
        )?;
        Ok(())
    }

    /// Retries exhausted (or fatal): move the job to the dead-letter table.
    pub fn dead_letter(&mut self, job: &Job, error: &str) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO dead_jobs
                 (id, job_type, queue, payload, retry_count, last_error, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.id,
                job.job_type,
                job.queue,
                job.payload,
                job.retry_count,
                error,
                Utc::now().timestamp_millis(),
            ],
        )?;
        tx.execute("DELETE FROM jobs WHERE id = ?1", params![job.id])?;
        tx.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Queue depths for the operator stats surface. `running` is reported by
    /// the dispatcher (its in-flight counter), not read back from here.
    pub fn counts(&self, now: DateTime<Utc>) -> Result<JobStatsSnapshot, StoreError> {
        let now_ms = now.timestamp_millis();
        let queued: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state = 'queued' AND run_at <= ?1",
            params![now_ms],
            |row| row.get(0),
        )?;
        let scheduled: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state = 'queued' AND run_at > ?1",
            params![now_ms],
            |row| row.get(0),
        )?;
        let dead: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM dead_jobs", [], |row| row.get(0))?;
        Ok(JobStatsSnapshot {
            queued,
            scheduled,
            running: 0,
            completed: 0,
            dead,
        })
    }

    /// All dead-lettered jobs, newest failure first.
    pub fn dead_letters(&self) -> Result<Vec<DeadJob>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, job_type, queue, payload, retry_count, last_error, failed_at
             FROM dead_jobs ORDER BY failed_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DeadJob {
                id: row.get(0)?,
                job_type: row.get(1)?,
                queue: row.get(2)?,
                payload: row.get(3)?,
                retry_count: row.get(4)?,
                last_error: row.get(5)?,
                failed_at: millis_to_utc(row.get(6)?),
            })
        })?;
        let mut dead = Vec::new();
        for r in rows {
            dead.push(r?);
        }
        Ok(dead)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), StoreError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(include_str!("schema.sql"))?;
    Ok(())
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn map_job(row: &rusqlite::Row<'_>) -> Result<Job, rusqlite::Error> {
    let timeout_ms: i64 = row.get(7)?;
    Ok(Job {
        id: row.get(0)?,
        job_type: row.get(1)?,
        queue: row.get(2)?,
        payload: row.get(3)?,
        run_at: millis_to_utc(row.get(4)?),
        retry_count: row.get(5)?,
        max_retries: row.get(6)?,
        timeout: Duration::from_millis(u64::try_from(timeout_ms).unwrap_or(0)),
        created_at: millis_to_utc(row.get(8)?),
        last_error: row.get(9)?,
    })
}
