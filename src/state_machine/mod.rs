mod job;
mod state;

pub use job::{FailReason, Job, JobPatch, JobStatus, JobTransition, JobType};
pub use state::{StateMachine, is_legal, reason};
