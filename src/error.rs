//! Error types for jobs and batches.

use std::{error::Error as StdError, time::Duration};

use thiserror::Error;

/// The result a completion handler receives: the job's result args, or the
/// reason it produced none.
pub type Outcome<T> = Result<T, JobError>;

/// Why a job finished without producing result args.
#[derive(Debug, Error)]
pub enum JobError {
    /// The computation returned an error.
    #[error("job computation failed: {0}")]
    Failed(#[source] Box<dyn StdError + Send + Sync + 'static>),
    /// The computation panicked. The panic was caught at the job boundary.
    #[error("job panicked: {0}")]
    Panicked(String),
    /// The job was dropped before it ever ran, for example because its thread
    /// could not be spawned or an executor discarded it.
    #[error("job was dropped before it executed")]
    NotExecuted,
}

impl JobError {
    pub(crate) fn failed<E>(error: E) -> JobError
    where
        E: StdError + Send + Sync + 'static,
    {
        JobError::Failed(Box::new(error))
    }
}

/// Returned when a second completion handler is registered on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("a completion handler is already registered on this job")]
pub struct AlreadySubscribed;

/// Errors that stop a batch from producing its accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    /// One of the jobs handed to the batch already had a completion handler.
    /// Nothing was launched.
    #[error("job {index} already has a completion handler")]
    AlreadySubscribed { index: usize },
    /// The batch deadline elapsed before every job finished. The listed jobs
    /// may still be running.
    #[error("batch deadline of {deadline:?} elapsed with {} job(s) outstanding", .outstanding.len())]
    DeadlineExceeded {
        deadline: Duration,
        outstanding: Vec<usize>,
    },
}
