use thiserror::Error;
use uuid::Uuid;

use crate::state_machine::{JobStatus, JobType};

pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Transition denied for job {job_id}: {from} -> {to}")]
    TransitionDenied {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Lease lost for job {job_id}: no longer claimed by {worker_id}")]
    LeaseLost { job_id: Uuid, worker_id: String },

    #[error("No handler registered for job type: {0}")]
    NoHandlerRegistered(JobType),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl SchedulerError {
    pub fn job_not_found(job_id: Uuid) -> Self {
        SchedulerError::JobNotFound(job_id.to_string())
    }

    /// True when a transition was refused because the job moved on.
    pub fn is_lost_race(&self) -> bool {
        matches!(
            self,
            SchedulerError::TransitionDenied { .. } | SchedulerError::LeaseLost { .. }
        )
    }
}

/// Classifies a job failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Transient failure (timeout, rate limit, network error, expired session).
    Retryable,
    /// Anything else; retrying will not help.
    Fatal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Retryable => write!(f, "retryable"),
            FailureKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Error returned by a job handler.
///
/// Handlers that know whether a failure is transient can say so with
/// [`HandlerError::retryable`] or [`HandlerError::fatal`]. Errors built from
/// plain messages carry no marker and are classified by their text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    kind: Option<FailureKind>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: Some(FailureKind::Retryable),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: Some(FailureKind::Fatal),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Explicit classification, if the handler supplied one.
    pub fn kind(&self) -> Option<FailureKind> {
        self.kind
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::new(message)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::new(format!("{err:#}"))
    }
}

impl From<SchedulerError> for HandlerError {
    fn from(err: SchedulerError) -> Self {
        HandlerError::new(err.to_string())
    }
}
