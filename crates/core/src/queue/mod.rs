//! Leased priority work queue on top of a SQLite table.
//!
//! Producers [`WorkQueue::put`] JSON payloads; consumers claim them with
//! [`WorkQueue::next`] and settle each claim through the returned [`Job`].
//! Any number of processes may share one database file.
//!
//! A job is `available`, `locked` (leased by one consumer) or `errored`.
//! Completed jobs are deleted. A lease older than the configured timeout
//! makes the job claimable again; only an explicit release spends an attempt.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::QueueConfig;

mod job;

pub use job::Job;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid collection name '{0}': expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidCollection(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Available,
    Locked,
    Errored,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Available => "available",
            JobStatus::Locked => "locked",
            JobStatus::Errored => "errored",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobStatus::Available),
            "locked" => Ok(JobStatus::Locked),
            "errored" => Ok(JobStatus::Errored),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|msg: String| FromSqlError::Other(msg.into()))
    }
}

/// Counts by job state, taken in one statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub available: u64,
    pub total: u64,
    pub locked: u64,
    pub errors: u64,
}

/// Full stored state of one job, for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub status: JobStatus,
    pub attempts_left: u32,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One job collection as seen by one consumer.
#[derive(Debug)]
pub struct WorkQueue {
    conn: Mutex<Connection>,
    table: String,
    consumer_id: String,
    lease_timeout: TimeDelta,
    max_attempts: u32,
}

impl WorkQueue {
    /// Open the collection described by `config`, creating its table if needed.
    pub fn open(config: &QueueConfig) -> QueueResult<Self> {
        validate_collection(&config.collection)?;
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::from_connection(conn, config)
    }

    /// Like [`WorkQueue::open`], ignoring `config.path`.
    pub fn open_in_memory(config: &QueueConfig) -> QueueResult<Self> {
        validate_collection(&config.collection)?;
        Self::from_connection(Connection::open_in_memory()?, config)
    }

    fn from_connection(conn: Connection, config: &QueueConfig) -> QueueResult<Self> {
        let table = config.collection.clone();
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                payload       TEXT NOT NULL,
                priority      INTEGER NOT NULL,
                status        TEXT NOT NULL,
                attempts_left INTEGER NOT NULL,
                locked_by     TEXT,
                locked_at     INTEGER,
                error_message TEXT,
                created_at    INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {table}_claim_order ON {table} (status, priority DESC, id);
            "#
        ))?;
        let consumer_id = config.consumer_id.clone().unwrap_or_else(generate_consumer_id);
        debug!(collection = %table, consumer = %consumer_id, "opened work queue");
        Ok(Self {
            conn: Mutex::new(conn),
            table,
            consumer_id,
            lease_timeout: TimeDelta::seconds(config.lease_timeout_secs as i64),
            max_attempts: config.max_attempts,
        })
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn collection(&self) -> &str {
        &self.table
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Enqueue `payload`; higher priorities are claimed first.
    pub fn put<T: Serialize + ?Sized>(&self, payload: &T, priority: i64) -> QueueResult<i64> {
        let payload = serde_json::to_string(payload)?;
        let conn = self.conn.lock();
        let id = conn.query_row(
            &format!(
                "INSERT INTO {} (payload, priority, status, attempts_left, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
                self.table
            ),
            params![payload, priority, JobStatus::Available, self.max_attempts, now_millis()],
            |row| row.get(0),
        )?;
        debug!(job_id = id, priority, "queued job");
        Ok(id)
    }

    pub fn put_default<T: Serialize + ?Sized>(&self, payload: &T) -> QueueResult<i64> {
        self.put(payload, 0)
    }

    /// Claim the highest-priority eligible job, oldest first among equals.
    ///
    /// Eligible means available, or locked under an expired lease, with
    /// attempts left. The claim is a single conditional update, so two
    /// consumers can never hold the same job.
    pub fn next(&self) -> QueueResult<Option<Job<'_>>> {
        let now = now_millis();
        let cutoff = now - self.lease_timeout.num_milliseconds();
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let claimed = tx
            .query_row(
                &format!(
                    r#"
                    UPDATE {t} SET status = 'locked', locked_by = ?1, locked_at = ?2
                    WHERE id = (
                        SELECT id FROM {t}
                        WHERE attempts_left > 0
                          AND (status = 'available' OR (status = 'locked' AND locked_at <= ?3))
                        ORDER BY priority DESC, id ASC
                        LIMIT 1
                    )
                    RETURNING id, payload, priority, attempts_left, locked_at
                    "#,
                    t = self.table
                ),
                params![self.consumer_id, now, cutoff],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;
        tx.commit()?;
        drop(conn);

        let Some((id, payload, priority, attempts_left, lease)) = claimed else {
            return Ok(None);
        };
        debug!(job_id = id, consumer = %self.consumer_id, attempts_left, "claimed job");
        let payload = serde_json::from_str(&payload)?;
        Ok(Some(Job::new(self, id, lease, payload, priority, attempts_left)))
    }

    /// Claim the next job and run `f` on it via [`Job::scope`].
    ///
    /// `Ok(None)` when nothing is eligible.
    pub fn process_next<T, E, F>(&self, f: F) -> Result<Option<T>, E>
    where
        F: FnOnce(&serde_json::Value) -> Result<T, E>,
        E: From<QueueError>,
    {
        match self.next()? {
            Some(job) => job.scope(f).map(Some),
            None => Ok(None),
        }
    }

    /// Number of available jobs.
    pub fn size(&self) -> QueueResult<u64> {
        Ok(self.stats()?.available)
    }

    pub fn stats(&self) -> QueueResult<QueueStats> {
        let conn = self.conn.lock();
        let stats = conn.query_row(
            &format!(
                r#"
                SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'available' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'locked' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'errored' THEN 1 ELSE 0 END), 0)
                FROM {}
                "#,
                self.table
            ),
            [],
            |row| {
                Ok(QueueStats {
                    total: row.get::<_, i64>(0)? as u64,
                    available: row.get::<_, i64>(1)? as u64,
                    locked: row.get::<_, i64>(2)? as u64,
                    errors: row.get::<_, i64>(3)? as u64,
                })
            },
        )?;
        Ok(stats)
    }

    /// Look up a job by id, whoever holds it.
    pub fn get(&self, job_id: i64) -> QueueResult<Option<JobRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT id, payload, priority, status, attempts_left, locked_by, locked_at, \
                     error_message, created_at FROM {} WHERE id = ?1",
                    self.table
                ),
                params![job_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, JobStatus>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, payload, priority, status, attempts_left, locked_by, locked_at, error, created)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(JobRecord {
            id,
            payload: serde_json::from_str(&payload)?,
            priority,
            status,
            attempts_left,
            locked_by,
            locked_at: locked_at.and_then(DateTime::from_timestamp_millis),
            error_message: error,
            created_at: DateTime::from_timestamp_millis(created).unwrap_or_default(),
        }))
    }

    /// Return expired leases to `available` without spending attempts.
    ///
    /// Exhausted jobs stay locked. Returns the number of repaired jobs.
    pub fn repair(&self) -> QueueResult<usize> {
        let cutoff = now_millis() - self.lease_timeout.num_milliseconds();
        let conn = self.conn.lock();
        let repaired = conn.execute(
            &format!(
                "UPDATE {} SET status = 'available', locked_by = NULL, locked_at = NULL \
                 WHERE status = 'locked' AND locked_at <= ?1 AND attempts_left > 0",
                self.table
            ),
            params![cutoff],
        )?;
        if repaired > 0 {
            info!(repaired, collection = %self.table, "returned expired leases to the queue");
        }
        Ok(repaired)
    }

    /// Drop every job in the collection.
    pub fn clear(&self) -> QueueResult<()> {
        let conn = self.conn.lock();
        let dropped = conn.execute(&format!("DELETE FROM {}", self.table), [])?;
        info!(dropped, collection = %self.table, "cleared work queue");
        Ok(())
    }

    // Settling requires the exact lease handed out by `next`: a reclaimed job
    // carries a newer `locked_at` even when the consumer id is reused.

    fn complete_job(&self, job_id: i64, lease: i64) -> QueueResult<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            &format!(
                "DELETE FROM {} WHERE id = ?1 AND locked_by = ?2 AND locked_at = ?3",
                self.table
            ),
            params![job_id, self.consumer_id, lease],
        )?;
        Ok(deleted > 0)
    }

    fn release_job(&self, job_id: i64, lease: i64) -> QueueResult<Option<u32>> {
        let conn = self.conn.lock();
        let remaining = conn
            .query_row(
                &format!(
                    r#"
                    UPDATE {} SET
                        attempts_left = attempts_left - 1,
                        status = CASE WHEN attempts_left > 1 THEN 'available' ELSE status END,
                        locked_by = CASE WHEN attempts_left > 1 THEN NULL ELSE locked_by END,
                        locked_at = CASE WHEN attempts_left > 1 THEN NULL ELSE locked_at END
                    WHERE id = ?1 AND locked_by = ?2 AND locked_at = ?3
                      AND status = 'locked' AND attempts_left > 0
                    RETURNING attempts_left
                    "#,
                    self.table
                ),
                params![job_id, self.consumer_id, lease],
                |row| row.get(0),
            )
            .optional()?;
        Ok(remaining)
    }

    fn error_job(&self, job_id: i64, lease: i64, message: &str) -> QueueResult<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET status = 'errored', error_message = ?4 \
                 WHERE id = ?1 AND locked_by = ?2 AND locked_at = ?3 AND status = 'locked'",
                self.table
            ),
            params![job_id, self.consumer_id, lease, message],
        )?;
        Ok(updated > 0)
    }
}

/// `consumer-<pid>-<random>`, distinct for every queue handle.
fn generate_consumer_id() -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("consumer-{}-{suffix:08x}", std::process::id())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn validate_collection(name: &str) -> QueueResult<()> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(QueueError::InvalidCollection(name.to_string()))
    }
}
