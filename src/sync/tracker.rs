//! SQLite-backed sync job progress.
//!
//! Every state change is a single conditional `UPDATE ... WHERE status =
//! 'running'`, so terminal states stick and late progress reports from a
//! cancelled run are dropped.

use super::{SyncJob, SyncKind, SyncStatus};
use crate::integration::{Environment, IntegrationKey};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SELECT_COLUMNS: &str = "id, seller_id, provider, environment, kind, processed, total,
     status, last_error, cancel_requested, started_at, updated_at, finished_at";

/// # Schema
/// ```sql
/// CREATE TABLE sync_jobs (
///     id TEXT PRIMARY KEY,
///     seller_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     environment TEXT NOT NULL,
///     kind TEXT NOT NULL,              -- inventory | orders
///     processed INTEGER NOT NULL,
///     total INTEGER,                   -- estimate, optional
///     status TEXT NOT NULL,            -- running | completed | failed | cancelled
///     last_error TEXT,
///     cancel_requested INTEGER NOT NULL,
///     started_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     finished_at TEXT
/// );
/// ```
pub struct SyncProgressTracker {
    conn: Mutex<Connection>,
}

/// Outcome of [`SyncProgressTracker::start`].
#[derive(Debug, Clone)]
pub struct JobStart {
    pub job: SyncJob,
    /// False when a job of the same kind was already running
    pub created: bool,
}

impl SyncProgressTracker {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open sync job database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_jobs (
                id               TEXT PRIMARY KEY,
                seller_id        TEXT NOT NULL,
                provider         TEXT NOT NULL,
                environment      TEXT NOT NULL,
                kind             TEXT NOT NULL,
                processed        INTEGER NOT NULL,
                total            INTEGER,
                status           TEXT NOT NULL,
                last_error       TEXT,
                cancel_requested INTEGER NOT NULL,
                started_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                finished_at      TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sync_jobs_seller ON sync_jobs(seller_id, status);",
        )
        .context("Failed to create sync_jobs table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates a running job, or returns the one already running for this
    /// integration and kind. Check and insert happen under one lock in one
    /// statement, so concurrent starts never produce two running jobs.
    pub fn start(
        &self,
        key: &IntegrationKey,
        kind: SyncKind,
        total_estimate: Option<u64>,
    ) -> Result<JobStart> {
        let id = uuid::Uuid::now_v7().to_string();
        let conn = self.conn.lock().unwrap();
        let inserted = conn
            .execute(
                "INSERT INTO sync_jobs
                    (id, seller_id, provider, environment, kind, processed, total, status,
                     last_error, cancel_requested, started_at, updated_at, finished_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, 0, ?6, 'running', NULL, 0, ?7, ?7, NULL
                 WHERE NOT EXISTS (
                     SELECT 1 FROM sync_jobs
                     WHERE seller_id = ?2 AND provider = ?3 AND environment = ?4
                       AND kind = ?5 AND status = 'running'
                 )",
                params![
                    id,
                    key.seller_id,
                    key.provider,
                    key.environment.as_str(),
                    kind.as_str(),
                    total_estimate.map(|t| t as i64),
                    timestamp(Utc::now()),
                ],
            )
            .context("Failed to insert sync job")?;

        if inserted == 1 {
            let job = load_job(&conn, &id)?
                .ok_or_else(|| anyhow::anyhow!("sync job {} vanished after insert", id))?;
            return Ok(JobStart { job, created: true });
        }

        let job = conn
            .query_row(
                &format!(
                    "SELECT {} FROM sync_jobs
                     WHERE seller_id = ?1 AND provider = ?2 AND environment = ?3
                       AND kind = ?4 AND status = 'running'
                     ORDER BY started_at DESC LIMIT 1",
                    SELECT_COLUMNS
                ),
                params![
                    key.seller_id,
                    key.provider,
                    key.environment.as_str(),
                    kind.as_str()
                ],
                row_to_job,
            )
            .context("Failed to load running sync job")?;
        Ok(JobStart {
            job,
            created: false,
        })
    }

    /// Adds `delta` to `processed`. A known total grows with it if exceeded.
    /// Returns false once the job is no longer running.
    pub fn advance(&self, job_id: &str, delta: u64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE sync_jobs
                 SET processed = processed + ?1,
                     total = CASE WHEN total IS NULL THEN NULL ELSE MAX(total, processed + ?1) END,
                     updated_at = ?2
                 WHERE id = ?3 AND status = 'running'",
                params![delta as i64, timestamp(Utc::now()), job_id],
            )
            .context("Failed to advance sync job")?;
        Ok(updated > 0)
    }

    /// Moves a running job to `cancelled`. Cancelling a finished job is a no-op.
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        self.finish(job_id, SyncStatus::Cancelled, None, true)
    }

    pub fn complete(&self, job_id: &str) -> Result<bool> {
        self.finish(job_id, SyncStatus::Completed, None, false)
    }

    pub fn fail(&self, job_id: &str, error: &str) -> Result<bool> {
        self.finish(job_id, SyncStatus::Failed, Some(error), false)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<SyncJob>> {
        let conn = self.conn.lock().unwrap();
        load_job(&conn, job_id)
    }

    pub fn is_cancelled(&self, job_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM sync_jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read sync job status")?;
        Ok(status.as_deref() == Some(SyncStatus::Cancelled.as_str()))
    }

    /// Running jobs of a seller.
    pub fn list_active(&self, seller_id: &str) -> Result<Vec<SyncJob>> {
        self.query_many(
            "WHERE seller_id = ?1 AND status = 'running' ORDER BY started_at ASC",
            params![seller_id],
        )
    }

    /// Every job of a seller, newest first.
    pub fn list_for_seller(&self, seller_id: &str, limit: usize) -> Result<Vec<SyncJob>> {
        self.query_many(
            "WHERE seller_id = ?1 ORDER BY started_at DESC LIMIT ?2",
            params![seller_id, limit as i64],
        )
    }

    /// Deletes finished jobs older than `older_than`. Returns how many were removed.
    pub fn purge_finished(&self, older_than: chrono::Duration) -> Result<usize> {
        let cutoff = timestamp(Utc::now() - older_than);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM sync_jobs WHERE status != 'running' AND finished_at < ?1",
            params![cutoff],
        )
        .context("Failed to purge sync jobs")
    }

    fn finish(
        &self,
        job_id: &str,
        status: SyncStatus,
        error: Option<&str>,
        cancel_requested: bool,
    ) -> Result<bool> {
        let now = timestamp(Utc::now());
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE sync_jobs
                 SET status = ?1,
                     last_error = COALESCE(?2, last_error),
                     cancel_requested = MAX(cancel_requested, ?3),
                     updated_at = ?4,
                     finished_at = ?4
                 WHERE id = ?5 AND status = 'running'",
                params![status.as_str(), error, cancel_requested, now, job_id],
            )
            .with_context(|| format!("Failed to mark sync job {}", status.as_str()))?;
        Ok(updated > 0)
    }

    fn query_many(&self, clause: &str, params: impl rusqlite::Params) -> Result<Vec<SyncJob>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM sync_jobs {}", SELECT_COLUMNS, clause);
        let mut stmt = conn.prepare(&sql).context("Failed to prepare sync job query")?;
        let jobs = stmt
            .query_map(params, row_to_job)
            .context("Failed to query sync jobs")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read sync jobs")?;
        Ok(jobs)
    }
}

/// Background task that drops finished jobs past their retention.
pub async fn run_job_cleanup(
    tracker: Arc<SyncProgressTracker>,
    interval_secs: u64,
    retention_secs: u64,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        interval.tick().await;
        match tracker.purge_finished(chrono::Duration::seconds(retention_secs as i64)) {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed = removed, "Purged finished sync jobs"),
            Err(e) => tracing::warn!(error = %e, "Sync job cleanup failed"),
        }
    }
}

fn load_job(conn: &Connection, job_id: &str) -> Result<Option<SyncJob>> {
    let sql = format!("SELECT {} FROM sync_jobs WHERE id = ?1", SELECT_COLUMNS);
    conn.query_row(&sql, params![job_id], row_to_job)
        .optional()
        .context("Failed to load sync job")
}

/// Fixed-width timestamps keep string comparison in SQL chronological.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<SyncJob> {
    let environment: String = row.get(3)?;
    let kind: String = row.get(4)?;
    let status: String = row.get(7)?;
    let total: Option<i64> = row.get(6)?;
    let finished_at: Option<String> = row.get(12)?;

    Ok(SyncJob {
        id: row.get(0)?,
        seller_id: row.get(1)?,
        provider: row.get(2)?,
        environment: environment
            .parse::<Environment>()
            .map_err(|e| conversion_error(3, e))?,
        kind: kind.parse::<SyncKind>().map_err(|e| conversion_error(4, e))?,
        processed: row.get::<_, i64>(5)? as u64,
        total: total.map(|t| t as u64),
        status: SyncStatus::parse(&status)
            .ok_or_else(|| conversion_error(7, format!("unknown status '{}'", status)))?,
        last_error: row.get(8)?,
        cancel_requested: row.get(9)?,
        started_at: parse_time(10, row.get(10)?)?,
        updated_at: parse_time(11, row.get(11)?)?,
        finished_at: finished_at.map(|t| parse_time(12, t)).transpose()?,
    })
}

fn parse_time(column: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    value
        .parse::<DateTime<Utc>>()
        .map_err(|e| conversion_error(column, e.to_string()))
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}
