//! Persistence contract for jobs and their transition log.
//!
//! Every adapter must make two operations atomic: the per-candidate claim in
//! [`JobStore::claim_runnable_jobs`] (a conditional update guarded by the
//! status the worker observed) and [`JobStore::transition_job`] (status check,
//! patch and transition insert as one unit). Workers share nothing else.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::state_machine::{Job, JobPatch, JobStatus, JobTransition, JobType};

pub use memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;

/// A job to be inserted in `PENDING`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
    pub next_run_at: DateTime<Utc>,
}

/// Read-only listing filter, ordered by `next_run_at` then `created_at`.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
    pub limit: usize,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.job_type.as_ref().is_none_or(|t| *t == job.job_type)
            && self.status.is_none_or(|s| s == job.status)
    }
}

#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub worker_id: String,
    pub now: DateTime<Utc>,
    pub limit: usize,
    pub lease_ms: u64,
}

impl ClaimRequest {
    /// Fails with `Validation` when `lease_ms` pushes the deadline past the
    /// representable range.
    pub fn lease_expires_at(&self) -> Result<DateTime<Utc>> {
        i64::try_from(self.lease_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .and_then(|lease| self.now.checked_add_signed(lease))
            .ok_or_else(|| {
                SchedulerError::Validation(format!("lease_ms {} is out of range", self.lease_ms))
            })
    }

    pub fn actor(&self) -> String {
        worker_actor(&self.worker_id)
    }
}

/// A guarded status change plus the audit fields of its transition record.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub job_id: Uuid,
    pub allowed_from: Vec<JobStatus>,
    pub to_status: JobStatus,
    pub actor: String,
    pub patch: JobPatch,
    pub reason_code: Option<String>,
    pub reason_message: Option<String>,
    /// When set, the job must still be claimed by this worker.
    pub expected_owner: Option<String>,
}

/// Actor string recorded for transitions made by a worker.
pub fn worker_actor(worker_id: &str) -> String {
    format!("worker:{worker_id}")
}

/// Check a transition against the job's current row. Adapters call this
/// inside their atomic section.
pub(crate) fn check_transition(job: &Job, request: &TransitionRequest) -> Result<()> {
    if !request.allowed_from.contains(&job.status) {
        return Err(SchedulerError::TransitionDenied {
            job_id: job.id,
            from: job.status,
            to: request.to_status,
        });
    }
    if let Some(owner) = &request.expected_owner
        && job.claimed_by.as_deref() != Some(owner.as_str())
    {
        return Err(SchedulerError::LeaseLost {
            job_id: job.id,
            worker_id: owner.clone(),
        });
    }
    Ok(())
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: NewJob) -> Result<Job>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    async fn find_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Most recent first.
    async fn list_transitions(&self, job_id: Uuid, limit: usize) -> Result<Vec<JobTransition>>;

    /// Claim up to `limit` runnable jobs for `worker_id`.
    ///
    /// Candidates are `PENDING`/`RETRY_WAIT` jobs with `next_run_at <= now`,
    /// oldest `next_run_at` first, then oldest `created_at`. Each claim is a
    /// conditional update on the observed status and on `next_run_at <= now`;
    /// candidates taken or rescheduled by another worker in the meantime are
    /// skipped silently. One `claimed` transition
    /// is written per successful claim.
    async fn claim_runnable_jobs(&self, request: &ClaimRequest) -> Result<Vec<Job>>;

    /// `RUNNING` jobs whose lease ended strictly before `now`.
    async fn list_lease_expired_running_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>>;

    /// Apply a guarded transition and record it. Fails with `JobNotFound`,
    /// `TransitionDenied` or `LeaseLost` without touching the job.
    async fn transition_job(&self, request: TransitionRequest) -> Result<Job>;
}
