//! SQLite adapter for the job store.
//!
//! Writes run inside `BEGIN IMMEDIATE` transactions so the status check, the
//! update and the transition insert hold the write lock together. Claims are
//! `UPDATE ... WHERE id = ? AND status = ? AND next_run_at <= ?` checked by
//! affected-row count.
//! Timestamps are stored as epoch milliseconds.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::{ClaimRequest, JobFilter, JobStore, NewJob, TransitionRequest, check_transition};
use crate::error::{Result, SchedulerError};
use crate::state_machine::{Job, JobStatus, JobTransition, JobType, reason};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id                 TEXT PRIMARY KEY,
        job_type           TEXT NOT NULL,
        status             TEXT NOT NULL,
        payload            TEXT NOT NULL,
        attempt_count      INTEGER NOT NULL DEFAULT 0,
        max_attempts       INTEGER NOT NULL,
        next_run_at        INTEGER NOT NULL,
        claimed_by         TEXT NULL,
        claim_expires_at   INTEGER NULL,
        last_error_code    TEXT NULL,
        last_error_message TEXT NULL,
        completed_at       INTEGER NULL,
        canceled_at        INTEGER NULL,
        created_at         INTEGER NOT NULL,
        updated_at         INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_runnable_idx ON jobs (status, next_run_at, created_at)",
    "CREATE INDEX IF NOT EXISTS jobs_lease_idx ON jobs (status, claim_expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS job_transitions (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id         TEXT NOT NULL REFERENCES jobs (id),
        from_status    TEXT NOT NULL,
        to_status      TEXT NOT NULL,
        reason_code    TEXT NULL,
        reason_message TEXT NULL,
        actor          TEXT NOT NULL,
        created_at     INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS job_transitions_job_idx ON job_transitions (job_id, created_at)",
];

const JOB_COLUMNS: &str = "id, job_type, status, payload, attempt_count, max_attempts, \
     next_run_at, claimed_by, claim_expires_at, last_error_code, last_error_message, \
     completed_at, canceled_at, created_at, updated_at";

/// Durable store shared by any number of worker processes.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database on a single connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // Dropping the transaction before `commit` rolls it back, including when
    // the caller's future is cancelled mid-flight.
    async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Conditional claim: succeeds only if the job is still in `observed`
    /// and still due at `request.now`.
    pub async fn try_claim(
        &self,
        job_id: Uuid,
        observed: JobStatus,
        request: &ClaimRequest,
    ) -> Result<Option<Job>> {
        if !observed.is_claimable() {
            return Ok(None);
        }
        let mut tx = self.begin_immediate().await?;
        let claimed = claim_in_tx(&mut tx, job_id, observed, request).await?;
        tx.commit().await?;
        Ok(claimed)
    }
}

async fn claim_in_tx(
    conn: &mut SqliteConnection,
    job_id: Uuid,
    observed: JobStatus,
    request: &ClaimRequest,
) -> Result<Option<Job>> {
    let now = Utc::now();
    let lease_expires_at = request.lease_expires_at()?;
    let affected = sqlx::query(
        r#"
        UPDATE jobs
        SET status = ?1,
            attempt_count = attempt_count + 1,
            claimed_by = ?2,
            claim_expires_at = ?3,
            updated_at = ?4
        WHERE id = ?5 AND status = ?6 AND next_run_at <= ?7
        "#,
    )
    .bind(JobStatus::Running.as_str())
    .bind(&request.worker_id)
    .bind(lease_expires_at.timestamp_millis())
    .bind(now.timestamp_millis())
    .bind(job_id.to_string())
    .bind(observed.as_str())
    .bind(request.now.timestamp_millis())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if affected == 0 {
        debug!(job_id = %job_id, worker_id = %request.worker_id, "claim lost to another worker");
        return Ok(None);
    }

    insert_transition(
        conn,
        job_id,
        observed,
        JobStatus::Running,
        Some(reason::CLAIMED),
        None,
        &request.actor(),
        now,
    )
    .await?;
    fetch_job(conn, job_id).await
}

async fn transition_in_tx(conn: &mut SqliteConnection, request: &TransitionRequest) -> Result<Job> {
    let current = fetch_job(conn, request.job_id)
        .await?
        .ok_or_else(|| SchedulerError::job_not_found(request.job_id))?;
    check_transition(&current, request)?;

    let now = Utc::now();
    let mut next = current.clone();
    next.status = request.to_status;
    next.apply(&request.patch);
    next.updated_at = now;

    sqlx::query(
        r#"
        UPDATE jobs
        SET status = ?1,
            next_run_at = ?2,
            claimed_by = ?3,
            claim_expires_at = ?4,
            last_error_code = ?5,
            last_error_message = ?6,
            completed_at = ?7,
            canceled_at = ?8,
            updated_at = ?9
        WHERE id = ?10
        "#,
    )
    .bind(next.status.as_str())
    .bind(next.next_run_at.timestamp_millis())
    .bind(next.claimed_by.as_deref())
    .bind(next.claim_expires_at.map(|t| t.timestamp_millis()))
    .bind(next.last_error_code.as_deref())
    .bind(next.last_error_message.as_deref())
    .bind(next.completed_at.map(|t| t.timestamp_millis()))
    .bind(next.canceled_at.map(|t| t.timestamp_millis()))
    .bind(now.timestamp_millis())
    .bind(next.id.to_string())
    .execute(&mut *conn)
    .await?;

    insert_transition(
        conn,
        next.id,
        current.status,
        next.status,
        request.reason_code.as_deref(),
        request.reason_message.as_deref(),
        &request.actor,
        now,
    )
    .await?;
    Ok(next)
}

#[allow(clippy::too_many_arguments)]
async fn insert_transition(
    conn: &mut SqliteConnection,
    job_id: Uuid,
    from: JobStatus,
    to: JobStatus,
    reason_code: Option<&str>,
    reason_message: Option<&str>,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO job_transitions
            (job_id, from_status, to_status, reason_code, reason_message, actor, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(job_id.to_string())
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(reason_code)
    .bind(reason_message)
    .bind(actor)
    .bind(now.timestamp_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn fetch_job(conn: &mut SqliteConnection, job_id: Uuid) -> Result<Option<Job>> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
        .bind(job_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.as_ref().map(job_from_row).transpose()?)
}

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

fn timestamp(millis: i64) -> std::result::Result<DateTime<Utc>, sqlx::Error> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| decode_error(format!("timestamp out of range: {millis}")))
}

fn optional_timestamp(millis: Option<i64>) -> std::result::Result<Option<DateTime<Utc>>, sqlx::Error> {
    millis.map(timestamp).transpose()
}

fn count(value: i64) -> std::result::Result<u32, sqlx::Error> {
    u32::try_from(value).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn job_from_row(row: &SqliteRow) -> std::result::Result<Job, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    Ok(Job {
        id: Uuid::parse_str(&id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        job_type: JobType::new(row.try_get::<String, _>("job_type")?),
        status: status.parse::<JobStatus>().map_err(decode_error)?,
        payload: serde_json::from_str(&payload).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        attempt_count: count(row.try_get("attempt_count")?)?,
        max_attempts: count(row.try_get("max_attempts")?)?,
        next_run_at: timestamp(row.try_get("next_run_at")?)?,
        claimed_by: row.try_get("claimed_by")?,
        claim_expires_at: optional_timestamp(row.try_get("claim_expires_at")?)?,
        last_error_code: row.try_get("last_error_code")?,
        last_error_message: row.try_get("last_error_message")?,
        completed_at: optional_timestamp(row.try_get("completed_at")?)?,
        canceled_at: optional_timestamp(row.try_get("canceled_at")?)?,
        created_at: timestamp(row.try_get("created_at")?)?,
        updated_at: timestamp(row.try_get("updated_at")?)?,
    })
}

fn transition_from_row(row: &SqliteRow) -> std::result::Result<JobTransition, sqlx::Error> {
    let job_id: String = row.try_get("job_id")?;
    let from: String = row.try_get("from_status")?;
    let to: String = row.try_get("to_status")?;
    Ok(JobTransition {
        id: row.try_get("id")?,
        job_id: Uuid::parse_str(&job_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        from_status: from.parse::<JobStatus>().map_err(decode_error)?,
        to_status: to.parse::<JobStatus>().map_err(decode_error)?,
        reason_code: row.try_get("reason_code")?,
        reason_message: row.try_get("reason_message")?,
        actor: row.try_get("actor")?,
        created_at: timestamp(row.try_get("created_at")?)?,
    })
}

fn limit(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, new_job: NewJob) -> Result<Job> {
        let job = Job::new(
            new_job.job_type,
            new_job.payload,
            new_job.max_attempts,
            new_job.next_run_at,
            Utc::now(),
        );
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, job_type, status, payload, attempt_count, max_attempts,
                 next_run_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(serde_json::to_string(&job.payload)?)
        .bind(i64::from(job.attempt_count))
        .bind(i64::from(job.max_attempts))
        .bind(job.next_run_at.timestamp_millis())
        .bind(job.created_at.timestamp_millis())
        .bind(job.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        debug!(job_id = %job.id, job_type = %job.job_type, "job created");
        Ok(job)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE (?1 IS NULL OR job_type = ?1) AND (?2 IS NULL OR status = ?2) \
             ORDER BY next_run_at ASC, created_at ASC, rowid ASC \
             LIMIT ?3"
        ))
        .bind(filter.job_type.as_ref().map(|t| t.as_str().to_string()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit(filter.limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(job_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn find_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>> {
        let mut conn = self.pool.acquire().await?;
        fetch_job(&mut conn, job_id).await
    }

    async fn list_transitions(&self, job_id: Uuid, max: usize) -> Result<Vec<JobTransition>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, from_status, to_status, reason_code, reason_message, actor, created_at
            FROM job_transitions
            WHERE job_id = ?1
            ORDER BY created_at DESC, id DESC
            LIMIT ?2
            "#,
        )
        .bind(job_id.to_string())
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(transition_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn claim_runnable_jobs(&self, request: &ClaimRequest) -> Result<Vec<Job>> {
        let candidates = sqlx::query(
            r#"
            SELECT id, status FROM jobs
            WHERE status IN (?1, ?2) AND next_run_at <= ?3
            ORDER BY next_run_at ASC, created_at ASC, rowid ASC
            LIMIT ?4
            "#,
        )
        .bind(JobStatus::Pending.as_str())
        .bind(JobStatus::RetryWait.as_str())
        .bind(request.now.timestamp_millis())
        .bind(limit(request.limit))
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for row in &candidates {
            let id: String = row.try_get("id")?;
            let status: String = row.try_get("status")?;
            let job_id = Uuid::parse_str(&id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
            let observed = status.parse::<JobStatus>().map_err(decode_error)?;
            if let Some(job) = self.try_claim(job_id, observed, request).await? {
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    async fn list_lease_expired_running_jobs(
        &self,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = ?1 AND claim_expires_at < ?2 \
             ORDER BY claim_expires_at ASC, created_at ASC \
             LIMIT ?3"
        ))
        .bind(JobStatus::Running.as_str())
        .bind(now.timestamp_millis())
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(job_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn transition_job(&self, request: TransitionRequest) -> Result<Job> {
        let mut tx = self.begin_immediate().await?;
        let job = transition_in_tx(&mut tx, &request).await?;
        tx.commit().await?;
        Ok(job)
    }
}
