//! The worker loop: recover expired leases, claim runnable jobs, run their
//! handlers and record each outcome through the state machine.
//!
//! Workers share no memory. Any number of them may run against the same
//! store; the store's conditional claim is the only point of contention.

pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{FailureKind, HandlerError, Result, SchedulerError};
use crate::handler::{HandlerRegistry, JobContext};
use crate::state_machine::{Job, StateMachine, reason};
use crate::store::{ClaimRequest, JobStore, worker_actor};

pub use retry::{RETRYABLE_PATTERNS, backoff_delay, classify, is_retryable_message};

/// Parameters of one worker iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub worker_id: String,
    /// Upper bound for both recovered and claimed jobs.
    pub limit: usize,
    pub lease_ms: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            limit: 10,
            lease_ms: 30_000,
        }
    }
}

/// Counters reported by [`JobWorker::run_once`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub recovered: usize,
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Claimed jobs whose outcome could not be recorded because the lease
    /// passed to someone else first.
    pub lease_lost: usize,
}

impl RunSummary {
    pub fn is_idle(&self) -> bool {
        self.recovered == 0 && self.claimed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Retried,
    Failed,
}

pub struct JobWorker {
    store: Arc<dyn JobStore>,
    state_machine: StateMachine,
    handlers: Arc<HandlerRegistry>,
}

impl JobWorker {
    pub fn new(store: Arc<dyn JobStore>, handlers: Arc<HandlerRegistry>) -> Self {
        if handlers.is_empty() {
            warn!("no job handlers registered; every claimed job will fail");
        }
        Self {
            state_machine: StateMachine::new(store.clone()),
            store,
            handlers,
        }
    }

    /// One iteration at time `now`.
    ///
    /// Handler failures end up in job state and never escape. Store errors
    /// abort the iteration and are returned as is.
    #[instrument(skip(self, opts), fields(worker_id = %opts.worker_id))]
    pub async fn run_once(&self, opts: &RunOptions, now: DateTime<Utc>) -> Result<RunSummary> {
        let mut summary = RunSummary {
            recovered: self.recover_expired_leases(opts, now).await?,
            ..RunSummary::default()
        };

        let claimed = self
            .store
            .claim_runnable_jobs(&ClaimRequest {
                worker_id: opts.worker_id.clone(),
                now,
                limit: opts.limit,
                lease_ms: opts.lease_ms,
            })
            .await?;
        summary.claimed = claimed.len();

        for job in claimed {
            match self.execute(&job, &opts.worker_id, now).await {
                Ok(Outcome::Completed) => summary.completed += 1,
                Ok(Outcome::Retried) => summary.retried += 1,
                Ok(Outcome::Failed) => summary.failed += 1,
                Err(err) if err.is_lost_race() => {
                    warn!(job_id = %job.id, error = %err, "outcome dropped: lease lost");
                    summary.lease_lost += 1;
                }
                Err(err) => return Err(err),
            }
        }

        if summary.is_idle() {
            debug!("run_once:idle");
        } else {
            info!(
                recovered = summary.recovered,
                claimed = summary.claimed,
                completed = summary.completed,
                retried = summary.retried,
                failed = summary.failed,
                lease_lost = summary.lease_lost,
                "run_once:done"
            );
        }
        Ok(summary)
    }

    async fn recover_expired_leases(&self, opts: &RunOptions, now: DateTime<Utc>) -> Result<usize> {
        let expired = self
            .store
            .list_lease_expired_running_jobs(now, opts.limit)
            .await?;
        let actor = worker_actor(&opts.worker_id);

        let mut recovered = 0;
        for job in expired {
            match self
                .state_machine
                .recover_expired_lease(job.id, &actor, now)
                .await
            {
                Ok(_) => {
                    warn!(
                        job_id = %job.id,
                        previous_owner = ?job.claimed_by,
                        "lease expired, job requeued"
                    );
                    recovered += 1;
                }
                Err(err) if err.is_lost_race() => {
                    debug!(job_id = %job.id, "lease already recovered elsewhere");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(recovered)
    }

    async fn execute(&self, job: &Job, worker_id: &str, now: DateTime<Utc>) -> Result<Outcome> {
        let ctx = JobContext {
            job_id: job.id,
            attempt_count: job.attempt_count,
        };
        debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempt_count, "job:start");

        let result = match self.handlers.get(&job.job_type) {
            Some(handler) => handler.handle(&job.payload, &ctx).await,
            None => Err(HandlerError::from(SchedulerError::NoHandlerRegistered(
                job.job_type.clone(),
            ))),
        };

        let err = match result {
            Ok(()) => {
                self.state_machine
                    .mark_completed(job.id, worker_id, Utc::now())
                    .await?;
                debug!(job_id = %job.id, "job:completed");
                return Ok(Outcome::Completed);
            }
            Err(err) => err,
        };

        if classify(&err) == FailureKind::Retryable && !job.attempts_exhausted() {
            let delay = backoff_delay(job.attempt_count);
            let next_run_at = now + TimeDelta::milliseconds(delay.as_millis() as i64);
            warn!(
                job_id = %job.id,
                attempt = job.attempt_count,
                max_attempts = job.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "job:retry_wait"
            );
            self.state_machine
                .mark_retry_wait(
                    job.id,
                    worker_id,
                    reason::RETRYABLE_ERROR,
                    err.message(),
                    next_run_at,
                )
                .await?;
            return Ok(Outcome::Retried);
        }

        let code = if job.attempts_exhausted() {
            reason::MAX_ATTEMPTS_EXCEEDED
        } else {
            reason::FATAL_ERROR
        };
        error!(
            job_id = %job.id,
            attempt = job.attempt_count,
            reason_code = code,
            error = %err,
            "job:failed"
        );
        self.state_machine
            .mark_failed(job.id, worker_id, code, err.message())
            .await?;
        Ok(Outcome::Failed)
    }

    /// Run iterations back to back, sleeping `interval` between them, until
    /// `token` is cancelled. An iteration in progress is allowed to finish.
    pub async fn run_until_cancelled<F>(
        &self,
        opts: &RunOptions,
        interval: Duration,
        token: CancellationToken,
        mut on_iteration: F,
    ) -> Result<()>
    where
        F: FnMut(&RunSummary),
    {
        info!(worker_id = %opts.worker_id, interval_ms = interval.as_millis() as u64, "worker:start");
        while !token.is_cancelled() {
            let summary = self.run_once(opts, Utc::now()).await?;
            on_iteration(&summary);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!(worker_id = %opts.worker_id, "worker:stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{JobStatus, JobType};
    use crate::store::{InMemoryJobStore, JobFilter, NewJob, TransitionRequest};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn opts(worker_id: &str) -> RunOptions {
        RunOptions {
            worker_id: worker_id.into(),
            ..RunOptions::default()
        }
    }

    fn always(
        job_type: JobType,
        result: fn() -> std::result::Result<(), HandlerError>,
    ) -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(job_type, move |_, _| async move { result() });
        Arc::new(registry)
    }

    async fn enqueue(store: &InMemoryJobStore, max_attempts: u32) -> Job {
        store
            .create_job(NewJob {
                job_type: JobType::trade_offer_create(),
                payload: json!({"sku": "5021;6"}),
                max_attempts,
                next_run_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn network_timeouts_retry_until_attempts_run_out() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = enqueue(&store, 3).await;
        let worker = JobWorker::new(
            store.clone(),
            always(JobType::trade_offer_create(), || Err("network timeout".into())),
        );
        let t0 = Utc::now();

        let first = worker.run_once(&opts("w1"), t0).await.unwrap();
        assert_eq!(first.retried, 1);
        let after = store.find_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::RetryWait);
        assert_eq!(after.attempt_count, 1);
        assert_eq!(after.next_run_at, t0 + ChronoDuration::milliseconds(2000));
        assert_eq!(after.last_error_code.as_deref(), Some(reason::RETRYABLE_ERROR));
        assert_eq!(after.last_error_message.as_deref(), Some("network timeout"));
        assert!(after.claimed_by.is_none());

        // Not yet due.
        let early = worker
            .run_once(&opts("w1"), t0 + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(early.claimed, 0);

        let t1 = t0 + ChronoDuration::seconds(3);
        let second = worker.run_once(&opts("w1"), t1).await.unwrap();
        assert_eq!(second.retried, 1);
        let after = store.find_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::RetryWait);
        assert_eq!(after.next_run_at, t1 + ChronoDuration::milliseconds(4000));

        let third = worker
            .run_once(&opts("w1"), t1 + ChronoDuration::seconds(5))
            .await
            .unwrap();
        assert_eq!(third.failed, 1);
        let after = store.find_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.attempt_count, 3);
        assert_eq!(
            after.last_error_code.as_deref(),
            Some(reason::MAX_ATTEMPTS_EXCEEDED)
        );

        let log = store.list_transitions(job.id, 10).await.unwrap();
        assert_eq!(log.len(), 6);
        assert_eq!(log[0].reason_code.as_deref(), Some(reason::MAX_ATTEMPTS_EXCEEDED));
        assert!(log.iter().all(|t| t.actor == "worker:w1"));
    }

    #[tokio::test]
    async fn expired_lease_is_recovered_then_completed_in_same_run() {
        let store = Arc::new(InMemoryJobStore::new());
        let now = Utc::now();
        let mut job = Job::new(
            JobType::trade_offer_create(),
            json!({}),
            5,
            now - ChronoDuration::minutes(2),
            now - ChronoDuration::minutes(2),
        );
        job.status = JobStatus::Running;
        job.attempt_count = 1;
        job.claimed_by = Some("crashed".into());
        job.claim_expires_at = Some(now - ChronoDuration::seconds(1));
        store.insert(job.clone()).await;

        let worker = JobWorker::new(
            store.clone(),
            always(JobType::trade_offer_create(), || Ok(())),
        );
        let summary = worker.run_once(&opts("w1"), now).await.unwrap();
        assert_eq!(
            summary,
            RunSummary {
                recovered: 1,
                claimed: 1,
                completed: 1,
                ..RunSummary::default()
            }
        );

        let done = store.find_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempt_count, 2);
        assert!(done.claimed_by.is_none());

        let codes: Vec<_> = store
            .list_transitions(job.id, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.reason_code.unwrap_or_default())
            .collect();
        assert_eq!(codes, vec!["completed", "claimed", "lease_expired"]);
    }

    #[tokio::test]
    async fn live_lease_is_left_alone() {
        let store = Arc::new(InMemoryJobStore::new());
        let now = Utc::now();
        let mut job = Job::new(JobType::trade_offer_create(), json!({}), 5, now, now);
        job.status = JobStatus::Running;
        job.attempt_count = 1;
        job.claimed_by = Some("w2".into());
        job.claim_expires_at = Some(now);
        store.insert(job.clone()).await;

        let worker = JobWorker::new(store.clone(), Arc::new(HandlerRegistry::new()));
        let summary = worker.run_once(&opts("w1"), now).await.unwrap();
        assert_eq!(summary, RunSummary::default());
    }

    #[tokio::test]
    async fn completion_time_is_taken_after_the_handler_returns() {
        let store = Arc::new(InMemoryJobStore::new());
        let worker = JobWorker::new(
            store.clone(),
            always(JobType::trade_offer_create(), || Ok(())),
        );

        // Iteration clock an hour ahead of the wall clock.
        let started = Utc::now();
        let iteration = started + ChronoDuration::hours(1);
        let job = store
            .create_job(NewJob {
                job_type: JobType::trade_offer_create(),
                payload: json!({}),
                max_attempts: 3,
                next_run_at: iteration,
            })
            .await
            .unwrap();
        worker.run_once(&opts("w1"), iteration).await.unwrap();

        let done = store.find_job_by_id(job.id).await.unwrap().unwrap();
        let completed_at = done.completed_at.unwrap();
        assert!(completed_at >= started);
        assert!(completed_at < iteration);
    }

    #[tokio::test]
    async fn missing_handler_fails_the_job() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = enqueue(&store, 5).await;
        let worker = JobWorker::new(store.clone(), Arc::new(HandlerRegistry::new()));

        let summary = worker.run_once(&opts("w1"), Utc::now()).await.unwrap();
        assert_eq!(summary.failed, 1);

        let failed = store.find_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_error_code.as_deref(), Some(reason::FATAL_ERROR));
        assert_eq!(
            failed.last_error_message.as_deref(),
            Some("No handler registered for job type: TRADE_OFFER_CREATE")
        );
    }

    #[tokio::test]
    async fn fatal_message_fails_on_first_attempt() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = enqueue(&store, 5).await;
        let worker = JobWorker::new(
            store.clone(),
            always(JobType::trade_offer_create(), || Err("invalid sku".into())),
        );

        worker.run_once(&opts("w1"), Utc::now()).await.unwrap();
        let failed = store.find_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.last_error_code.as_deref(), Some(reason::FATAL_ERROR));
    }

    #[tokio::test]
    async fn explicit_markers_beat_message_text() {
        let store = Arc::new(InMemoryJobStore::new());
        let retry_job = enqueue(&store, 5).await;
        let worker = JobWorker::new(
            store.clone(),
            always(JobType::trade_offer_create(), || {
                Err(HandlerError::retryable("inventory locked"))
            }),
        );
        worker.run_once(&opts("w1"), Utc::now()).await.unwrap();
        let job = store.find_job_by_id(retry_job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::RetryWait);

        let store = Arc::new(InMemoryJobStore::new());
        let fatal_job = enqueue(&store, 5).await;
        let worker = JobWorker::new(
            store.clone(),
            always(JobType::trade_offer_create(), || {
                Err(HandlerError::fatal("network timeout, but the offer was declined"))
            }),
        );
        worker.run_once(&opts("w1"), Utc::now()).await.unwrap();
        let job = store.find_job_by_id(fatal_job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn outcome_after_lost_lease_is_dropped() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = enqueue(&store, 5).await;
        let machine = StateMachine::new(store.clone());

        // Another worker recovers the lease while the handler is still running.
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobType::trade_offer_create(), move |_, ctx| {
            let machine = machine.clone();
            async move {
                machine
                    .recover_expired_lease(ctx.job_id, "worker:w2", Utc::now())
                    .await?;
                Ok::<(), HandlerError>(())
            }
        });
        let worker = JobWorker::new(store.clone(), Arc::new(registry));

        let summary = worker.run_once(&opts("w1"), Utc::now()).await.unwrap();
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.lease_lost, 1);

        let after = store.find_job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::RetryWait);
    }

    #[tokio::test]
    async fn concurrent_workers_run_each_job_once() {
        let store = Arc::new(InMemoryJobStore::new());
        for _ in 0..5 {
            enqueue(&store, 3).await;
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = calls.clone();
        registry.register_fn(JobType::trade_offer_create(), move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok::<(), HandlerError>(())
            }
        });
        let registry = Arc::new(registry);
        let w1 = JobWorker::new(store.clone(), registry.clone());
        let w2 = JobWorker::new(store.clone(), registry);

        let now = Utc::now();
        let (opts1, opts2) = (opts("w1"), opts("w2"));
        let (a, b) = tokio::join!(w1.run_once(&opts1, now), w2.run_once(&opts2, now));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.claimed + b.claimed, 5);
        assert_eq!(a.completed + b.completed, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let jobs = store
            .list_jobs(&JobFilter {
                job_type: None,
                status: Some(JobStatus::Completed),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(jobs.len(), 5);
        assert!(jobs.iter().all(|j| j.attempt_count == 1));
    }

    #[tokio::test]
    async fn limit_bounds_claims() {
        let store = Arc::new(InMemoryJobStore::new());
        for _ in 0..3 {
            enqueue(&store, 3).await;
        }
        let worker = JobWorker::new(
            store.clone(),
            always(JobType::trade_offer_create(), || Ok(())),
        );
        let summary = worker
            .run_once(
                &RunOptions {
                    limit: 2,
                    ..opts("w1")
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(summary.claimed, 2);
    }

    #[tokio::test]
    async fn watch_loop_stops_when_cancelled() {
        let store = Arc::new(InMemoryJobStore::new());
        enqueue(&store, 3).await;
        let worker = JobWorker::new(
            store.clone(),
            always(JobType::trade_offer_create(), || Ok(())),
        );
        let token = CancellationToken::new();
        let stop = token.clone();
        let mut summaries = Vec::new();

        worker
            .run_until_cancelled(&opts("w1"), Duration::from_secs(3600), token, |summary| {
                summaries.push(*summary);
                stop.cancel();
            })
            .await
            .unwrap();

        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].completed, 1);
    }

    #[tokio::test]
    async fn watch_loop_does_nothing_when_already_cancelled() {
        let store = Arc::new(InMemoryJobStore::new());
        let worker = JobWorker::new(store, Arc::new(HandlerRegistry::new()));
        let token = CancellationToken::new();
        token.cancel();

        let mut iterations = 0;
        worker
            .run_until_cancelled(&opts("w1"), Duration::from_millis(10), token, |_| {
                iterations += 1
            })
            .await
            .unwrap();
        assert_eq!(iterations, 0);
    }

    struct UnavailableStore;

    #[async_trait]
    impl JobStore for UnavailableStore {
        async fn create_job(&self, _job: NewJob) -> Result<Job> {
            Err(unavailable())
        }
        async fn list_jobs(&self, _filter: &JobFilter) -> Result<Vec<Job>> {
            Err(unavailable())
        }
        async fn find_job_by_id(&self, _job_id: Uuid) -> Result<Option<Job>> {
            Err(unavailable())
        }
        async fn list_transitions(
            &self,
            _job_id: Uuid,
            _limit: usize,
        ) -> Result<Vec<crate::state_machine::JobTransition>> {
            Err(unavailable())
        }
        async fn claim_runnable_jobs(&self, _request: &ClaimRequest) -> Result<Vec<Job>> {
            Err(unavailable())
        }
        async fn list_lease_expired_running_jobs(
            &self,
            _now: DateTime<Utc>,
            _limit: usize,
        ) -> Result<Vec<Job>> {
            Err(unavailable())
        }
        async fn transition_job(&self, _request: TransitionRequest) -> Result<Job> {
            Err(unavailable())
        }
    }

    fn unavailable() -> SchedulerError {
        SchedulerError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "store unavailable",
        ))
    }

    #[tokio::test]
    async fn store_errors_propagate() {
        let worker = JobWorker::new(Arc::new(UnavailableStore), Arc::new(HandlerRegistry::new()));
        let err = worker.run_once(&opts("w1"), Utc::now()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Io(_)));

        let err = worker
            .run_until_cancelled(
                &opts("w1"),
                Duration::from_millis(10),
                CancellationToken::new(),
                |_| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Io(_)));
    }
}
