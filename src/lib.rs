//! Durable job scheduler for a fleet of trading bots.
//!
//! Jobs live in a shared [`store::JobStore`]; any number of
//! [`worker::JobWorker`]s claim them with a conditional update, run the
//! handler registered for the job type and record the outcome through the
//! [`state_machine::StateMachine`]. Operators act on jobs through
//! [`service::JobService`].

pub mod config;
pub mod error;
pub mod handler;
pub mod logging;
pub mod service;
pub mod state_machine;
pub mod store;
pub mod worker;

pub use error::{FailureKind, HandlerError, Result, SchedulerError};
pub use handler::{HandlerRegistry, JobContext, JobHandler};
pub use service::JobService;
pub use state_machine::{Job, JobStatus, JobTransition, JobType, StateMachine};
pub use store::{InMemoryJobStore, JobStore, SqliteJobStore};
pub use worker::{JobWorker, RunOptions, RunSummary};
