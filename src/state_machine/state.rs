use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::job::{Job, JobPatch, JobStatus};
use crate::error::{Result, SchedulerError};
use crate::store::{JobStore, TransitionRequest};

/// Reason codes written to the transition log.
pub mod reason {
    pub const CLAIMED: &str = "claimed";
    pub const COMPLETED: &str = "completed";
    pub const RETRYABLE_ERROR: &str = "retryable_error";
    pub const FATAL_ERROR: &str = "fatal_error";
    pub const MAX_ATTEMPTS_EXCEEDED: &str = "max_attempts_exceeded";
    pub const LEASE_EXPIRED: &str = "lease_expired";
    pub const CANCELED_BY_OPERATOR: &str = "canceled_by_operator";
    pub const MANUAL_RETRY: &str = "manual_retry";

    pub const LEASE_EXPIRED_MESSAGE: &str = "Worker lease expired while job was RUNNING.";
}

/// The legal transition graph.
///
/// ```text
/// PENDING, RETRY_WAIT -> RUNNING      claim
/// RUNNING             -> COMPLETED    handler success
/// RUNNING             -> RETRY_WAIT   retryable failure / lease expired
/// RUNNING             -> FAILED       fatal failure / attempts exhausted
/// PENDING, RETRY_WAIT -> CANCELED     operator cancel
/// FAILED              -> PENDING      operator retry
/// ```
pub fn is_legal(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending | RetryWait, Running)
            | (Running, Completed | RetryWait | Failed)
            | (Pending | RetryWait, Canceled)
            | (Failed, Pending)
    )
}

/// The only component allowed to change a job's status.
///
/// Each method maps to one row of the transition table. The store applies
/// the guard, the patch and the transition record atomically, so a denied
/// transition leaves no trace.
#[derive(Clone)]
pub struct StateMachine {
    store: Arc<dyn JobStore>,
}

impl StateMachine {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Generic guarded transition.
    ///
    /// `allowed_from` is narrowed to the statuses from which `to` is legal,
    /// so an edge outside the table is always denied. Moving to any status
    /// other than `RUNNING` clears the claim fields. `RUNNING` itself is only
    /// reachable through a claim.
    #[allow(clippy::too_many_arguments)]
    pub async fn transition(
        &self,
        job_id: Uuid,
        allowed_from: &[JobStatus],
        to: JobStatus,
        actor: &str,
        patch: JobPatch,
        reason_code: Option<&str>,
        reason_message: Option<&str>,
    ) -> Result<Job> {
        self.apply(TransitionRequest {
            job_id,
            allowed_from: allowed_from.to_vec(),
            to_status: to,
            actor: actor.to_string(),
            patch,
            reason_code: reason_code.map(str::to_string),
            reason_message: reason_message.map(str::to_string),
            expected_owner: None,
        })
        .await
    }

    async fn apply(&self, mut request: TransitionRequest) -> Result<Job> {
        if request.to_status == JobStatus::Running {
            return Err(SchedulerError::Validation(
                "jobs enter RUNNING only by being claimed".into(),
            ));
        }
        let to = request.to_status;
        request.allowed_from.retain(|from| is_legal(*from, to));
        request.patch = request.patch.clear_claim();

        debug!(
            job_id = %request.job_id,
            to = %to,
            actor = %request.actor,
            reason_code = ?request.reason_code,
            "transition:start"
        );
        let job = self.store.transition_job(request).await?;
        debug!(job_id = %job.id, status = %job.status, "transition:done");
        Ok(job)
    }

    /// `completed_at` is when the handler returned, not when the job was
    /// claimed.
    pub async fn mark_completed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<Job> {
        self.apply(TransitionRequest {
            job_id,
            allowed_from: vec![JobStatus::Running],
            to_status: JobStatus::Completed,
            actor: crate::store::worker_actor(worker_id),
            patch: JobPatch::new().completed_at(completed_at),
            reason_code: Some(reason::COMPLETED.into()),
            reason_message: None,
            expected_owner: Some(worker_id.to_string()),
        })
        .await
    }

    pub async fn mark_retry_wait(
        &self,
        job_id: Uuid,
        worker_id: &str,
        reason_code: &str,
        reason_message: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<Job> {
        self.apply(TransitionRequest {
            job_id,
            allowed_from: vec![JobStatus::Running],
            to_status: JobStatus::RetryWait,
            actor: crate::store::worker_actor(worker_id),
            patch: JobPatch::new()
                .next_run_at(next_run_at)
                .last_error(reason_code, reason_message),
            reason_code: Some(reason_code.into()),
            reason_message: Some(reason_message.into()),
            expected_owner: Some(worker_id.to_string()),
        })
        .await
    }

    pub async fn mark_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        reason_code: &str,
        reason_message: &str,
    ) -> Result<Job> {
        self.apply(TransitionRequest {
            job_id,
            allowed_from: vec![JobStatus::Running],
            to_status: JobStatus::Failed,
            actor: crate::store::worker_actor(worker_id),
            patch: JobPatch::new().last_error(reason_code, reason_message),
            reason_code: Some(reason_code.into()),
            reason_message: Some(reason_message.into()),
            expected_owner: Some(worker_id.to_string()),
        })
        .await
    }

    /// Requeue a `RUNNING` job whose lease ran out. Not owner-guarded: the
    /// previous owner is presumed gone.
    pub async fn recover_expired_lease(
        &self,
        job_id: Uuid,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        self.transition(
            job_id,
            &[JobStatus::Running],
            JobStatus::RetryWait,
            actor,
            JobPatch::new().next_run_at(now),
            Some(reason::LEASE_EXPIRED),
            Some(reason::LEASE_EXPIRED_MESSAGE),
        )
        .await
    }

    pub async fn cancel(
        &self,
        job_id: Uuid,
        actor: &str,
        reason_code: Option<&str>,
        reason_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        self.transition(
            job_id,
            &JobStatus::CLAIMABLE,
            JobStatus::Canceled,
            actor,
            JobPatch::new().canceled_at(now),
            Some(reason_code.unwrap_or(reason::CANCELED_BY_OPERATOR)),
            reason_message,
        )
        .await
    }

    /// Operator retry of a `FAILED` job. `attempt_count` is kept.
    pub async fn retry(
        &self,
        job_id: Uuid,
        actor: &str,
        reason_code: Option<&str>,
        reason_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        self.transition(
            job_id,
            &[JobStatus::Failed],
            JobStatus::Pending,
            actor,
            JobPatch::new().next_run_at(now),
            Some(reason_code.unwrap_or(reason::MANUAL_RETRY)),
            reason_message,
        )
        .await
    }
}
