//! The registry of jobs tracked by a driver.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;

use super::DriverError;
use crate::job::JobDescription;
use crate::job::JobHandle;
use crate::job::JobStatus;

/// The latest observation of a tracked job.
pub type Observation = Result<JobStatus, DriverError>;

/// A job tracked by the registry.
#[derive(Debug)]
struct TrackedJob {
    /// The handle of the job.
    handle: JobHandle,
    /// The engine's key for the job (e.g. a task id), if any.
    key: Option<String>,
    /// The sender publishing observations of the job.
    status: watch::Sender<Observation>,
}

impl TrackedJob {
    /// Determines if the job still needs to be polled.
    fn is_live(&self) -> bool {
        matches!(&*self.status.borrow(), Ok(status) if !status.state.is_terminal())
    }
}

/// Maps live job handles to their observations and to the engine's keys.
///
/// The internal lock is never held across an await point.
#[derive(Debug, Default)]
pub struct JobRegistry {
    /// The tracked jobs, keyed by job id.
    jobs: Mutex<HashMap<String, TrackedJob>>,
}

impl JobRegistry {
    /// Constructs an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a job.
    ///
    /// If the job is already tracked, its existing observations are kept.
    pub fn insert(&self, handle: JobHandle) -> watch::Receiver<Observation> {
        let mut jobs = self.jobs.lock().expect("failed to lock job registry");
        jobs.entry(handle.id().to_string())
            .or_insert_with(|| TrackedJob {
                handle,
                key: None,
                status: watch::Sender::new(Ok(JobStatus::submitted())),
            })
            .status
            .subscribe()
    }

    /// Associates the engine's key with a tracked job.
    ///
    /// Returns `false` if the job is not tracked.
    pub fn set_key(&self, id: &str, key: impl Into<String>) -> bool {
        let mut jobs = self.jobs.lock().expect("failed to lock job registry");
        match jobs.get_mut(id) {
            Some(job) => {
                job.key = Some(key.into());
                true
            }
            None => false,
        }
    }

    /// Gets the engine's key of a tracked job.
    pub fn key(&self, id: &str) -> Option<String> {
        let jobs = self.jobs.lock().expect("failed to lock job registry");
        jobs.get(id).and_then(|j| j.key.clone())
    }

    /// Gets the handle of a tracked job.
    pub fn handle(&self, id: &str) -> Option<JobHandle> {
        let jobs = self.jobs.lock().expect("failed to lock job registry");
        jobs.get(id).map(|j| j.handle.clone())
    }

    /// Subscribes to the observations of a tracked job.
    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<Observation>> {
        let jobs = self.jobs.lock().expect("failed to lock job registry");
        jobs.get(id).map(|j| j.status.subscribe())
    }

    /// Gets the latest observation of a tracked job.
    pub fn latest(&self, id: &str) -> Option<Observation> {
        let jobs = self.jobs.lock().expect("failed to lock job registry");
        jobs.get(id).map(|j| j.status.borrow().clone())
    }

    /// Merges a scheduler description into the observation of the described
    /// job.
    ///
    /// Returns the new status if the job's state changed.
    pub fn observe(&self, description: &JobDescription) -> Option<JobStatus> {
        let jobs = self.jobs.lock().expect("failed to lock job registry");
        let job = jobs.get(&description.id)?;

        let mut changed = None;
        job.status.send_if_modified(|observation| match observation {
            Ok(status) => {
                let before = status.log_stream.is_some();
                let state_changed = status.merge(description);
                if state_changed {
                    changed = Some(status.clone());
                }
                state_changed || before != status.log_stream.is_some()
            }
            Err(_) => false,
        });

        changed
    }

    /// Records an unrecoverable error for a tracked job.
    ///
    /// Jobs already observed in a terminal state keep that state.
    pub fn fail(&self, id: &str, error: DriverError) {
        let jobs = self.jobs.lock().expect("failed to lock job registry");
        if let Some(job) = jobs.get(id) {
            job.status.send_if_modified(|observation| {
                let live = matches!(observation, Ok(status) if !status.state.is_terminal());
                if live {
                    *observation = Err(error);
                }
                live
            });
        }
    }

    /// Gets the ids of the tracked jobs that have not reached a terminal
    /// state.
    pub fn live_ids(&self) -> Vec<String> {
        let jobs = self.jobs.lock().expect("failed to lock job registry");
        let mut ids = jobs
            .iter()
            .filter(|(_, j)| j.is_live())
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Stops tracking a job.
    pub fn remove(&self, id: &str) -> Option<JobHandle> {
        let mut jobs = self.jobs.lock().expect("failed to lock job registry");
        jobs.remove(id).map(|j| j.handle)
    }

    /// Gets the number of tracked jobs.
    pub fn len(&self) -> usize {
        self.jobs.lock().expect("failed to lock job registry").len()
    }

    /// Determines if no jobs are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
