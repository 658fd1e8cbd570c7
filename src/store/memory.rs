use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ClaimRequest, JobFilter, JobStore, NewJob, TransitionRequest, check_transition};
use crate::error::{Result, SchedulerError};
use crate::state_machine::{Job, JobStatus, JobTransition, reason};

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Stored>,
    transitions: Vec<JobTransition>,
    next_seq: u64,
}

struct Stored {
    // Insertion order; breaks `created_at` ties.
    seq: u64,
    job: Job,
}

impl Inner {
    #[allow(clippy::too_many_arguments)]
    fn push_transition(
        &mut self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        reason_code: Option<String>,
        reason_message: Option<String>,
        actor: String,
        now: DateTime<Utc>,
    ) {
        let id = self.transitions.len() as i64 + 1;
        self.transitions.push(JobTransition {
            id,
            job_id,
            from_status: from,
            to_status: to,
            reason_code,
            reason_message,
            actor,
            created_at: now,
        });
    }

    fn sorted<'a>(&'a self, mut keep: impl FnMut(&Job) -> bool) -> Vec<&'a Stored> {
        let mut rows: Vec<&Stored> = self.jobs.values().filter(|s| keep(&s.job)).collect();
        rows.sort_by(|a, b| {
            a.job
                .next_run_at
                .cmp(&b.job.next_run_at)
                .then(a.job.created_at.cmp(&b.job.created_at))
                .then(a.seq.cmp(&b.seq))
        });
        rows
    }
}

/// Process-local store behind a single async mutex.
///
/// Claim candidates are selected and claimed under separate lock
/// acquisitions, so concurrent claimers race exactly as they would against a
/// database and the conditional update decides the winner.
#[derive(Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job as-is, replacing any job with the same id. No transition
    /// is recorded.
    pub(crate) async fn insert(&self, job: Job) {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(job.id, Stored { seq, job });
    }

    /// Conditional claim: succeeds only if the job is still in `observed`
    /// and still due at `request.now`.
    pub async fn try_claim(
        &self,
        job_id: Uuid,
        observed: JobStatus,
        request: &ClaimRequest,
    ) -> Result<Option<Job>> {
        let lease_expires_at = request.lease_expires_at()?;
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let claimed = {
            let Some(stored) = inner.jobs.get_mut(&job_id) else {
                return Ok(None);
            };
            if stored.job.status != observed
                || !observed.is_claimable()
                || stored.job.next_run_at > request.now
            {
                return Ok(None);
            }
            let job = &mut stored.job;
            job.status = JobStatus::Running;
            job.attempt_count += 1;
            job.claimed_by = Some(request.worker_id.clone());
            job.claim_expires_at = Some(lease_expires_at);
            job.updated_at = now;
            job.clone()
        };
        inner.push_transition(
            job_id,
            observed,
            JobStatus::Running,
            Some(reason::CLAIMED.to_string()),
            None,
            request.actor(),
            now,
        );
        Ok(Some(claimed))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, new_job: NewJob) -> Result<Job> {
        let job = Job::new(
            new_job.job_type,
            new_job.payload,
            new_job.max_attempts,
            new_job.next_run_at,
            Utc::now(),
        );
        self.insert(job.clone()).await;
        Ok(job)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sorted(|job| filter.matches(job))
            .into_iter()
            .take(filter.limit)
            .map(|s| s.job.clone())
            .collect())
    }

    async fn find_job_by_id(&self, job_id: Uuid) -> Result<Option<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(&job_id).map(|s| s.job.clone()))
    }

    async fn list_transitions(&self, job_id: Uuid, limit: usize) -> Result<Vec<JobTransition>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transitions
            .iter()
            .rev()
            .filter(|t| t.job_id == job_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_runnable_jobs(&self, request: &ClaimRequest) -> Result<Vec<Job>> {
        let candidates: Vec<(Uuid, JobStatus)> = {
            let inner = self.inner.lock().await;
            inner
                .sorted(|job| job.is_runnable(request.now))
                .into_iter()
                .take(request.limit)
                .map(|s| (s.job.id, s.job.status))
                .collect()
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for (job_id, observed) in candidates {
            if let Some(job) = self.try_claim(job_id, observed, request).await? {
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    async fn list_lease_expired_running_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<&Stored> = inner
            .jobs
            .values()
            .filter(|s| s.job.lease_expired(now))
            .collect();
        rows.sort_by(|a, b| {
            a.job
                .claim_expires_at
                .cmp(&b.job.claim_expires_at)
                .then(a.job.created_at.cmp(&b.job.created_at))
                .then(a.seq.cmp(&b.seq))
        });
        Ok(rows.into_iter().take(limit).map(|s| s.job.clone()).collect())
    }

    async fn transition_job(&self, request: TransitionRequest) -> Result<Job> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let (from, updated) = {
            let stored = inner
                .jobs
                .get_mut(&request.job_id)
                .ok_or_else(|| SchedulerError::job_not_found(request.job_id))?;
            check_transition(&stored.job, &request)?;

            let from = stored.job.status;
            stored.job.status = request.to_status;
            stored.job.apply(&request.patch);
            stored.job.updated_at = now;
            (from, stored.job.clone())
        };
        inner.push_transition(
            request.job_id,
            from,
            request.to_status,
            request.reason_code,
            request.reason_message,
            request.actor,
            now,
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{JobPatch, JobType};
    use chrono::Duration;
    use serde_json::json;
    use std::sync::Arc;

    fn new_job(next_run_at: DateTime<Utc>) -> NewJob {
        NewJob {
            job_type: JobType::trade_offer_create(),
            payload: json!({"sku": "5021;6"}),
            max_attempts: 3,
            next_run_at,
        }
    }

    fn claim(worker: &str, now: DateTime<Utc>, limit: usize) -> ClaimRequest {
        ClaimRequest {
            worker_id: worker.into(),
            now,
            limit,
            lease_ms: 30_000,
        }
    }

    #[tokio::test]
    async fn create_and_find() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.create_job(new_job(now)).await.unwrap();

        let found = store.find_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(found, job);
        assert_eq!(found.status, JobStatus::Pending);
        assert!(store.find_job_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_orders_by_next_run_then_creation() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let late = store.create_job(new_job(now - Duration::seconds(1))).await.unwrap();
        let first = store.create_job(new_job(now - Duration::seconds(10))).await.unwrap();
        let second = store.create_job(new_job(now - Duration::seconds(10))).await.unwrap();
        let future = store.create_job(new_job(now + Duration::seconds(60))).await.unwrap();

        let claimed = store.claim_runnable_jobs(&claim("w1", now, 10)).await.unwrap();
        let ids: Vec<Uuid> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id, second.id, late.id]);

        let untouched = store.find_job_by_id(future.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Pending);
        assert_eq!(untouched.attempt_count, 0);
    }

    #[tokio::test]
    async fn claim_sets_lease_and_records_transition() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.create_job(new_job(now)).await.unwrap();

        let claimed = store.claim_runnable_jobs(&claim("w1", now, 1)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let running = &claimed[0];
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.attempt_count, 1);
        assert_eq!(running.claimed_by.as_deref(), Some("w1"));
        assert_eq!(running.claim_expires_at, Some(now + Duration::seconds(30)));

        let log = store.list_transitions(job.id, 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].from_status, JobStatus::Pending);
        assert_eq!(log[0].to_status, JobStatus::Running);
        assert_eq!(log[0].reason_code.as_deref(), Some("claimed"));
        assert_eq!(log[0].actor, "worker:w1");
    }

    #[tokio::test]
    async fn claim_respects_limit() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        for _ in 0..5 {
            store.create_job(new_job(now)).await.unwrap();
        }
        let claimed = store.claim_runnable_jobs(&claim("w1", now, 2)).await.unwrap();
        assert_eq!(claimed.len(), 2);
    }

    #[tokio::test]
    async fn stale_observation_loses_the_claim() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.create_job(new_job(now)).await.unwrap();

        let first = store
            .try_claim(job.id, JobStatus::Pending, &claim("w1", now, 1))
            .await
            .unwrap();
        let second = store
            .try_claim(job.id, JobStatus::Pending, &claim("w2", now, 1))
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        let row = store.find_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(row.claimed_by.as_deref(), Some("w1"));
        assert_eq!(row.attempt_count, 1);
        assert_eq!(store.list_transitions(job.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_claimers_get_disjoint_jobs() {
        let store = Arc::new(InMemoryJobStore::new());
        let now = Utc::now();
        let job = store.create_job(new_job(now)).await.unwrap();

        let (req1, req2) = (claim("w1", now, 10), claim("w2", now, 10));
        let (a, b) = tokio::join!(
            store.claim_runnable_jobs(&req1),
            store.claim_runnable_jobs(&req2),
        );
        let total = a.unwrap().len() + b.unwrap().len();
        assert_eq!(total, 1);

        let row = store.find_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(row.attempt_count, 1);
        assert_eq!(row.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn stale_claim_on_rescheduled_job_is_rejected() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.create_job(new_job(now)).await.unwrap();

        // w2 claims and fails the job back into RETRY_WAIT, due much later,
        // after w1 already saw it as a due RETRY_WAIT candidate.
        store.claim_runnable_jobs(&claim("w2", now, 1)).await.unwrap();
        let later = now + Duration::seconds(64);
        store
            .transition_job(TransitionRequest {
                job_id: job.id,
                allowed_from: vec![JobStatus::Running],
                to_status: JobStatus::RetryWait,
                actor: "worker:w2".into(),
                patch: JobPatch::new().clear_claim().next_run_at(later),
                reason_code: Some("retryable_error".into()),
                reason_message: Some("HTTP 503".into()),
                expected_owner: Some("w2".into()),
            })
            .await
            .unwrap();

        let stale = store
            .try_claim(job.id, JobStatus::RetryWait, &claim("w1", now, 1))
            .await
            .unwrap();
        assert!(stale.is_none());

        let row = store.find_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::RetryWait);
        assert_eq!(row.attempt_count, 1);
        assert_eq!(row.next_run_at, later);

        let due = store
            .try_claim(job.id, JobStatus::RetryWait, &claim("w1", later, 1))
            .await
            .unwrap();
        assert_eq!(due.unwrap().attempt_count, 2);
    }

    #[tokio::test]
    async fn oversized_lease_fails_the_claim() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.create_job(new_job(now)).await.unwrap();

        let err = store
            .claim_runnable_jobs(&ClaimRequest {
                lease_ms: u64::MAX,
                ..claim("w1", now, 1)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
        let row = store.find_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn lease_expired_listing_is_strict() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.create_job(new_job(now)).await.unwrap();
        let claimed = store
            .claim_runnable_jobs(&ClaimRequest {
                lease_ms: 1_000,
                ..claim("w1", now, 1)
            })
            .await
            .unwrap();
        let expires = claimed[0].claim_expires_at.unwrap();

        assert!(store.list_lease_expired_running_jobs(expires, 10).await.unwrap().is_empty());
        let stale = store
            .list_lease_expired_running_jobs(expires + Duration::milliseconds(1), 10)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[tokio::test]
    async fn list_filters_and_limits() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.create_job(new_job(now)).await.unwrap();
        store.create_job(new_job(now)).await.unwrap();
        store
            .create_job(NewJob {
                job_type: JobType::new("price_refresh"),
                ..new_job(now)
            })
            .await
            .unwrap();

        let trades = store
            .list_jobs(&JobFilter {
                job_type: Some(JobType::trade_offer_create()),
                status: Some(JobStatus::Pending),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(trades.len(), 2);

        let limited = store
            .list_jobs(&JobFilter {
                job_type: None,
                status: None,
                limit: 1,
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn transition_denied_leaves_no_record() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(new_job(Utc::now())).await.unwrap();

        let err = store
            .transition_job(TransitionRequest {
                job_id: job.id,
                allowed_from: vec![JobStatus::Failed],
                to_status: JobStatus::Pending,
                actor: "op".into(),
                patch: JobPatch::new(),
                reason_code: None,
                reason_message: None,
                expected_owner: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::TransitionDenied {
                from: JobStatus::Pending,
                to: JobStatus::Pending,
                ..
            }
        ));
        assert!(store.list_transitions(job.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transitions_listed_newest_first() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.create_job(new_job(now)).await.unwrap();
        store.claim_runnable_jobs(&claim("w1", now, 1)).await.unwrap();
        store
            .transition_job(TransitionRequest {
                job_id: job.id,
                allowed_from: vec![JobStatus::Running],
                to_status: JobStatus::Completed,
                actor: "worker:w1".into(),
                patch: JobPatch::new().clear_claim().completed_at(now),
                reason_code: Some("completed".into()),
                reason_message: None,
                expected_owner: Some("w1".into()),
            })
            .await
            .unwrap();

        let log = store.list_transitions(job.id, 10).await.unwrap();
        let codes: Vec<_> = log.iter().map(|t| t.reason_code.as_deref()).collect();
        assert_eq!(codes, vec![Some("completed"), Some("claimed")]);
        assert_eq!(store.list_transitions(job.id, 1).await.unwrap().len(), 1);
    }
}
