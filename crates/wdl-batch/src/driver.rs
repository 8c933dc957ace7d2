//! Implementation of the job driver.
//!
//! The driver submits jobs to a [`BatchScheduler`], tracks their state and
//! hands callers clean terminal outcomes.
//!
//! Submission is idempotent on the job's fingerprint: concurrent callers
//! submitting the same fingerprint wait on a single in-flight submission and
//! receive the same handle. State is observed by a single poll loop (see
//! [`poller`]) that describes outstanding jobs in batches and publishes each
//! job's observations on its own channel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::BatchConfig;
use crate::config::RetryConfig;
use crate::job::CANCEL_REASON;
use crate::job::Fingerprint;
use crate::job::JobHandle;
use crate::job::JobSpec;
use crate::job::JobStatus;
use crate::scheduler::BatchScheduler;
use crate::scheduler::SchedulerError;

pub mod poller;
pub mod registry;

use poller::Poller;
pub use registry::JobRegistry;
pub use registry::Observation;

/// Represents an error from the job driver.
///
/// A job that runs and fails is not an error: it is reported as a terminal
/// [`JobState::Failed`](crate::job::JobState::Failed) status.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// The scheduler rejected a job submission.
    #[error("failed to submit job `{name}`: {message}")]
    Submission {
        /// The name of the job.
        name: String,
        /// The rejection message.
        message: String,
    },
    /// The scheduler rejected a request other than a submission.
    #[error("scheduler rejected {operation}: {message}")]
    Rejected {
        /// The operation that was rejected.
        operation: String,
        /// The rejection message.
        message: String,
    },
    /// A transient failure persisted past the retry budget.
    #[error("{operation} failed after {attempts} attempt(s): {message}")]
    Infrastructure {
        /// The operation that failed.
        operation: String,
        /// The number of attempts made.
        attempts: u32,
        /// The last error message.
        message: String,
    },
    /// The job is not tracked by the driver.
    #[error("job `{0}` is not tracked by the driver")]
    UnknownJob(String),
    /// The wait for a terminal state timed out.
    #[error("timed out after {timeout:?} waiting for job `{id}`")]
    TimedOut {
        /// The id of the job.
        id: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },
    /// The wait for a terminal state was cancelled.
    #[error("wait for job `{0}` was cancelled")]
    Cancelled(String),
    /// The driver has been closed.
    #[error("the job driver is closed")]
    Closed,
}

impl DriverError {
    /// Determines if the error is an infrastructure failure.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Infrastructure { .. })
    }

    /// Determines if the error is a submission or configuration failure.
    pub fn is_submission(&self) -> bool {
        matches!(self, Self::Submission { .. } | Self::Rejected { .. })
    }
}

/// Runs a scheduler operation, retrying transient errors with exponential
/// backoff.
pub(crate) async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut action: F,
) -> Result<T, DriverError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SchedulerError>>,
{
    let mut attempts = 0;
    let result = Retry::spawn_notify(
        config.strategy(),
        || {
            attempts += 1;
            let fut = action();
            async move {
                fut.await.map_err(|e| {
                    if e.is_transient() {
                        RetryError::transient(e)
                    } else {
                        RetryError::permanent(e)
                    }
                })
            }
        },
        {
            let operation = operation.to_owned();
            move |e: &SchedulerError, delay: Duration| {
                warn!(operation = operation.as_str(), error = %e, ?delay, "retrying scheduler operation");
            }
        },
    )
    .await;

    result.map_err(|e| match e {
        SchedulerError::Transient(message) => DriverError::Infrastructure {
            operation: operation.to_string(),
            attempts,
            message,
        },
        SchedulerError::Rejected(message) => DriverError::Rejected {
            operation: operation.to_string(),
            message,
        },
    })
}

/// Submits, tracks and cancels remote jobs.
///
/// A driver is opened for the lifetime of a run with [`JobDriver::open`],
/// which starts its poll loop, and stopped with [`JobDriver::close`].
pub struct JobDriver {
    /// The scheduler jobs are submitted to.
    scheduler: Arc<dyn BatchScheduler>,
    /// The tracked jobs.
    registry: Arc<JobRegistry>,
    /// The submissions made by the driver, keyed by fingerprint.
    submissions: Mutex<HashMap<Fingerprint, Arc<OnceCell<JobHandle>>>>,
    /// The retry configuration.
    retry: RetryConfig,
    /// The minimum interval between submissions.
    submit_interval: Option<Duration>,
    /// The time of the last submission.
    last_submit: tokio::sync::Mutex<Option<Instant>>,
    /// The token stopping the poll loop.
    token: CancellationToken,
    /// The poll loop task.
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl JobDriver {
    /// Opens a driver for the given scheduler and starts its poll loop.
    ///
    /// This must be called from within a Tokio runtime.
    pub fn open(scheduler: Arc<dyn BatchScheduler>, config: &BatchConfig) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let token = CancellationToken::new();
        let batch_size = config
            .poll
            .batch_size()
            .min(scheduler.describe_batch_size())
            .max(1);

        let poller = Poller::new(
            scheduler.clone(),
            registry.clone(),
            config.poll.interval(),
            batch_size,
            config.retry.clone(),
        )
        .spawn(token.clone());

        debug!(
            interval = ?config.poll.interval(),
            batch_size,
            "opened job driver"
        );

        Self {
            scheduler,
            registry,
            submissions: Default::default(),
            retry: config.retry.clone(),
            submit_interval: config.submit_interval(),
            last_submit: Default::default(),
            token,
            poller: Mutex::new(Some(poller)),
        }
    }

    /// Stops the poll loop.
    ///
    /// Waits on any job after closing fail with [`DriverError::Closed`].
    pub async fn close(&self) {
        self.token.cancel();
        let poller = self.poller.lock().expect("failed to lock poller").take();
        if let Some(poller) = poller
            && let Err(e) = poller.await
        {
            error!("job poller failed: {e}");
        }
    }

    /// Gets the registry of tracked jobs.
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Submits a job.
    ///
    /// If a job with the same fingerprint was already submitted by this
    /// driver (or is being submitted concurrently), its handle is returned
    /// and no new remote job is created.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobHandle, DriverError> {
        if self.token.is_cancelled() {
            return Err(DriverError::Closed);
        }

        let cell = {
            let mut submissions = self.submissions.lock().expect("failed to lock submissions");
            submissions
                .entry(spec.fingerprint().clone())
                .or_default()
                .clone()
        };

        if cell.initialized() {
            debug!(
                fingerprint = %spec.fingerprint(),
                "job was already submitted"
            );
        }

        let handle = cell
            .get_or_try_init(|| self.submit_remote(&spec))
            .await?
            .clone();

        // Tracking is idempotent; this re-tracks a deduplicated job that was
        // already released
        self.registry.insert(handle.clone());
        Ok(handle)
    }

    /// Performs the remote submission of a job.
    ///
    /// After a transient failure the outcome of the failed request is
    /// unknown, so the next attempt first looks for a job with the same
    /// (deterministic) name and adopts it if found.
    async fn submit_remote(&self, spec: &JobSpec) -> Result<JobHandle, DriverError> {
        let uncertain = AtomicBool::new(false);
        let uncertain = &uncertain;
        let scheduler = &*self.scheduler;

        let id = with_retry(&self.retry, "job submission", move || async move {
            if uncertain.load(Ordering::SeqCst)
                && let Some(id) = scheduler.find(spec.queue(), spec.name()).await?
            {
                info!(job_id = %id, name = spec.name(), "adopted previously submitted job");
                return Ok(id);
            }

            self.throttle().await;
            scheduler.submit(spec).await.inspect_err(|e| {
                if e.is_transient() {
                    uncertain.store(true, Ordering::SeqCst);
                }
            })
        })
        .await
        .map_err(|e| match e {
            DriverError::Rejected { message, .. } => DriverError::Submission {
                name: spec.name().to_string(),
                message,
            },
            e => e,
        })?;

        let handle = JobHandle::new(id, spec);
        info!(
            job_id = %handle,
            name = spec.name(),
            queue = spec.queue(),
            "submitted job"
        );
        Ok(handle)
    }

    /// Waits until the configured interval since the last submission has
    /// elapsed.
    async fn throttle(&self) {
        let Some(interval) = self.submit_interval else {
            return;
        };

        let mut last = self.last_submit.lock().await;
        if let Some(last) = *last {
            tokio::time::sleep_until(last + interval).await;
        }

        *last = Some(Instant::now());
    }

    /// Gets the latest observed status of a job without waiting.
    pub fn poll(&self, handle: &JobHandle) -> Result<JobStatus, DriverError> {
        self.registry
            .latest(handle.id())
            .ok_or_else(|| DriverError::UnknownJob(handle.id().to_string()))?
    }

    /// Requests termination of a job.
    ///
    /// Cancelling a job already observed in a terminal state does nothing. A
    /// cancellation that races with the job's completion is not an error:
    /// whichever terminal state is observed first is kept.
    pub async fn cancel(&self, handle: &JobHandle) -> Result<(), DriverError> {
        if let Ok(status) = self.poll(handle)
            && status.state.is_terminal()
        {
            debug!(job_id = %handle, state = %status.state, "job is already terminal");
            return Ok(());
        }

        let scheduler = &*self.scheduler;
        let id = handle.id();
        match with_retry(&self.retry, "job termination", move || async move {
            scheduler.terminate(id, CANCEL_REASON).await
        })
        .await
        {
            Ok(()) => {
                info!(job_id = %handle, "requested job termination");
                Ok(())
            }
            Err(DriverError::Rejected { message, .. }) => {
                debug!(job_id = %handle, message, "scheduler declined to terminate job");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Waits for a job to reach a terminal state.
    ///
    /// The wait ends early with [`DriverError::Cancelled`] when `token` is
    /// cancelled or with [`DriverError::TimedOut`] after `timeout`; in either
    /// case the remote job is left running and the caller decides whether to
    /// [`cancel`](Self::cancel) it.
    pub async fn await_terminal(
        &self,
        handle: &JobHandle,
        token: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<JobStatus, DriverError> {
        let mut rx = self
            .registry
            .subscribe(handle.id())
            .ok_or_else(|| DriverError::UnknownJob(handle.id().to_string()))?;

        let terminal = async {
            loop {
                {
                    let observation = rx.borrow_and_update();
                    match &*observation {
                        Ok(status) if status.state.is_terminal() => return Ok(status.clone()),
                        Ok(_) => {}
                        Err(e) => return Err(e.clone()),
                    }
                }

                if rx.changed().await.is_err() {
                    return Err(DriverError::UnknownJob(handle.id().to_string()));
                }
            }
        };

        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            res = terminal => res,
            _ = self.token.cancelled() => Err(DriverError::Closed),
            _ = token.cancelled() => Err(DriverError::Cancelled(handle.id().to_string())),
            _ = deadline => Err(DriverError::TimedOut {
                id: handle.id().to_string(),
                timeout: timeout.unwrap_or_default(),
            }),
        }
    }

    /// Stops tracking a job whose outcome has been consumed.
    ///
    /// Returns `false` if the job was not tracked.
    pub fn release(&self, handle: &JobHandle) -> bool {
        let released = self.registry.remove(handle.id()).is_some();
        if released {
            debug!(job_id = %handle, "released job");
        }

        released
    }
}

impl Drop for JobDriver {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
