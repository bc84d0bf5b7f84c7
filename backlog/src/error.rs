use crate::JobError;
use crate::JobId;
use crate::JobState;
use std::time::Duration;
use thiserror::Error;

/// List of error types that can occur while working with a [`Queue`](crate::Queue).
///
/// `DuplicateId`, `NotFound` and the transition errors are contract violations
/// and are surfaced to the caller right away. `Processing` and `Timeout` are
/// routed through the retry policy and only become visible as the
/// `last_error` of a failed job.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} already exists")]
    DuplicateId(JobId),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} can not move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },
    #[error("job {id} can not be inserted in state {state}, expected pending or delayed")]
    InvalidInitialState { id: JobId, state: JobState },
    #[error("job {0} is active and can not be removed")]
    JobActive(JobId),
    #[error("all {concurrency} worker slots are busy")]
    PoolSaturated { concurrency: usize },
    #[error("no processor is registered for job name `{0}`")]
    UnknownJobName(String),
    #[error(transparent)]
    Processing(#[from] JobError),
    #[error("job timed out after {0:?}")]
    Timeout(Duration),
    #[error("the queue has been stopped and can not be started again")]
    ShutDown,
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),
    #[error("the shared state of the store became poisoned")]
    SharedStatePoisoned,
}

impl QueueError {
    /// Whether the error comes from running a job and should go through the retry policy.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, QueueError::Processing(_) | QueueError::Timeout(_))
    }
}
