//! Operator-facing job operations. Independent of any running worker.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::handler::TradeOfferCreatePayload;
use crate::state_machine::{FailReason, Job, JobTransition, JobType, StateMachine};
use crate::store::{JobFilter, JobStore, NewJob};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A job together with its most recent transitions, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInspection {
    pub job: Job,
    pub transitions: Vec<JobTransition>,
}

#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    state_machine: StateMachine,
    default_max_attempts: u32,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            state_machine: StateMachine::new(store.clone()),
            store,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn default_max_attempts(&self) -> u32 {
        self.default_max_attempts
    }

    /// Create a `PENDING` job due now.
    pub async fn enqueue(&self, job_type: JobType, payload: Value, max_attempts: u32) -> Result<Job> {
        if max_attempts == 0 {
            return Err(SchedulerError::Validation(
                "maxAttempts must be a positive integer".into(),
            ));
        }
        let job = self
            .store
            .create_job(NewJob {
                job_type,
                payload,
                max_attempts,
                next_run_at: Utc::now(),
            })
            .await?;
        info!(job_id = %job.id, job_type = %job.job_type, max_attempts, "job enqueued");
        Ok(job)
    }

    pub async fn enqueue_trade_offer(
        &self,
        payload: TradeOfferCreatePayload,
        max_attempts: Option<u32>,
    ) -> Result<Job> {
        payload.validate()?;
        self.enqueue(
            JobType::trade_offer_create(),
            serde_json::to_value(&payload)?,
            max_attempts.unwrap_or(self.default_max_attempts),
        )
        .await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        if filter.limit == 0 {
            return Err(SchedulerError::Validation("limit must be a positive integer".into()));
        }
        self.store.list_jobs(filter).await
    }

    pub async fn inspect_job(&self, job_id: Uuid, transition_limit: usize) -> Result<JobInspection> {
        let job = self.require(job_id).await?;
        let transitions = self.store.list_transitions(job_id, transition_limit).await?;
        Ok(JobInspection { job, transitions })
    }

    /// `FAILED -> PENDING`. The attempt counter is not reset.
    pub async fn retry(
        &self,
        job_id: Uuid,
        actor: &str,
        reason_code: Option<&str>,
        reason_message: Option<&str>,
    ) -> Result<Job> {
        let job = self
            .state_machine
            .retry(job_id, actor, reason_code, reason_message, Utc::now())
            .await?;
        info!(job_id = %job.id, actor, "job requeued by operator");
        Ok(job)
    }

    /// `PENDING | RETRY_WAIT -> CANCELED`. Running jobs cannot be cancelled.
    pub async fn cancel(
        &self,
        job_id: Uuid,
        actor: &str,
        reason_code: Option<&str>,
        reason_message: Option<&str>,
    ) -> Result<Job> {
        let job = self
            .state_machine
            .cancel(job_id, actor, reason_code, reason_message, Utc::now())
            .await?;
        info!(job_id = %job.id, actor, "job canceled by operator");
        Ok(job)
    }

    pub async fn get_fail_reason(&self, job_id: Uuid) -> Result<FailReason> {
        let job = self.require(job_id).await?;
        Ok(FailReason::from(&job))
    }

    async fn require(&self, job_id: Uuid) -> Result<Job> {
        self.store
            .find_job_by_id(job_id)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(job_id))
    }
}
