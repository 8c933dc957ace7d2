//! The interface to a remote batch scheduler.

use async_trait::async_trait;
use thiserror::Error;

use crate::job::JobDescription;
use crate::job::JobSpec;

pub mod aws;

pub use aws::AwsBatchScheduler;

/// The maximum number of jobs AWS Batch describes in one request.
pub const DEFAULT_DESCRIBE_BATCH_SIZE: usize = 100;

/// Represents an error returned by a scheduler.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// A transient error (throttling, capacity, network) worth retrying.
    #[error("transient scheduler error: {0}")]
    Transient(String),
    /// The scheduler rejected the request (e.g. an invalid queue or a
    /// malformed job definition); retrying will not help.
    #[error("scheduler rejected the request: {0}")]
    Rejected(String),
}

impl SchedulerError {
    /// Determines if the error is transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A remote batch scheduler.
///
/// Implementations only translate requests; retrying, deduplication and
/// state tracking are the job driver's concern.
#[async_trait]
pub trait BatchScheduler: Send + Sync {
    /// Submits a job, returning the scheduler-assigned job id.
    async fn submit(&self, spec: &JobSpec) -> Result<String, SchedulerError>;

    /// Finds a job that was previously submitted to the given queue under the
    /// given name.
    ///
    /// This is used to adopt a job whose submission succeeded remotely even
    /// though the response was lost.
    async fn find(&self, queue: &str, name: &str) -> Result<Option<String>, SchedulerError>;

    /// Describes the given jobs.
    ///
    /// Jobs unknown to the scheduler are omitted from the response.
    async fn describe(&self, ids: &[String]) -> Result<Vec<JobDescription>, SchedulerError>;

    /// Requests termination of a job.
    async fn terminate(&self, id: &str, reason: &str) -> Result<(), SchedulerError>;

    /// The maximum number of jobs accepted by one call to
    /// [`describe`](Self::describe).
    fn describe_batch_size(&self) -> usize {
        DEFAULT_DESCRIBE_BATCH_SIZE
    }
}
