use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    RetryWait,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::RetryWait,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Canceled,
    ];

    /// Statuses a worker may claim from.
    pub const CLAIMABLE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::RetryWait];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::RetryWait => "RETRY_WAIT",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_claimable(&self) -> bool {
        Self::CLAIMABLE.contains(self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase();
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| format!("Unsupported job status: {s}"))
    }
}

/// Tag selecting which handler processes a job's payload.
///
/// Job types are an open set: the embedding application decides which tags
/// exist by registering handlers for them. Tags are stored upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobType(String);

impl JobType {
    pub const TRADE_OFFER_CREATE: &'static str = "TRADE_OFFER_CREATE";

    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_uppercase())
    }

    pub fn trade_offer_create() -> Self {
        Self(Self::TRADE_OFFER_CREATE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = JobType::new(s);
        let valid = !tag.0.is_empty()
            && tag
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
        if valid {
            Ok(tag)
        } else {
            Err(format!("Unsupported job type: {s}"))
        }
    }
}

/// One unit of deferred work.
///
/// `claimed_by` and `claim_expires_at` are set only while the job is
/// `RUNNING`; `attempt_count` only moves when a worker claims the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh `PENDING` job. Stores call this from `create_job`.
    pub fn new(
        job_type: JobType,
        payload: serde_json::Value,
        max_attempts: u32,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            payload,
            attempt_count: 0,
            max_attempts,
            next_run_at,
            claimed_by: None,
            claim_expires_at: None,
            last_error_code: None,
            last_error_message: None,
            completed_at: None,
            canceled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && self.claim_expires_at.is_some_and(|expires| expires < now)
    }

    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.next_run_at <= now
    }

    /// Apply a patch in place. Fields the patch leaves unset are untouched.
    pub fn apply(&mut self, patch: &JobPatch) {
        if let Some(next_run_at) = patch.next_run_at {
            self.next_run_at = next_run_at;
        }
        if let Some(claimed_by) = &patch.claimed_by {
            self.claimed_by = claimed_by.clone();
        }
        if let Some(claim_expires_at) = patch.claim_expires_at {
            self.claim_expires_at = claim_expires_at;
        }
        if let Some(code) = &patch.last_error_code {
            self.last_error_code = code.clone();
        }
        if let Some(message) = &patch.last_error_message {
            self.last_error_message = message.clone();
        }
        if let Some(completed_at) = patch.completed_at {
            self.completed_at = completed_at;
        }
        if let Some(canceled_at) = patch.canceled_at {
            self.canceled_at = canceled_at;
        }
    }
}

/// Field updates applied together with a status change.
///
/// The outer `Option` means "leave as is"; for nullable columns the inner
/// `Option` is the new value, so `Some(None)` clears the column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub next_run_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<Option<String>>,
    pub claim_expires_at: Option<Option<DateTime<Utc>>>,
    pub last_error_code: Option<Option<String>>,
    pub last_error_message: Option<Option<String>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub canceled_at: Option<Option<DateTime<Utc>>>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    pub fn clear_claim(mut self) -> Self {
        self.claimed_by = Some(None);
        self.claim_expires_at = Some(None);
        self
    }

    pub fn last_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.last_error_code = Some(Some(code.into()));
        self.last_error_message = Some(Some(message.into()));
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(Some(at));
        self
    }

    pub fn canceled_at(mut self, at: DateTime<Utc>) -> Self {
        self.canceled_at = Some(Some(at));
        self
    }
}

/// Immutable audit record written for every status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTransition {
    pub id: i64,
    pub job_id: Uuid,
    pub from_status: JobStatus,
    pub to_status: JobStatus,
    pub reason_code: Option<String>,
    pub reason_message: Option<String>,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

/// Failure details of a job, as shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailReason {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for FailReason {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            last_error_code: job.last_error_code.clone(),
            last_error_message: job.last_error_message.clone(),
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            updated_at: job.updated_at,
        }
    }
}
