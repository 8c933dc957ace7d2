//! The batch-poll loop of a job driver.
//!
//! On every tick the loop collects the live jobs of the registry that are not
//! already being described, splits them into chunks no larger than the
//! scheduler's describe limit and describes each chunk on its own task. A slow
//! or failing chunk therefore never holds up the others; its jobs are simply
//! skipped by later ticks until it finishes.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use super::JobRegistry;
use super::with_retry;
use crate::config::RetryConfig;
use crate::scheduler::BatchScheduler;

/// Polls the scheduler for the state of the jobs in a registry.
pub(crate) struct Poller {
    /// The scheduler to poll.
    scheduler: Arc<dyn BatchScheduler>,
    /// The registry receiving observations.
    registry: Arc<JobRegistry>,
    /// The interval between ticks.
    interval: Duration,
    /// The maximum number of jobs described per request.
    batch_size: usize,
    /// The retry configuration for describe requests.
    retry: RetryConfig,
}

impl Poller {
    /// Constructs a new poller.
    pub(crate) fn new(
        scheduler: Arc<dyn BatchScheduler>,
        registry: Arc<JobRegistry>,
        interval: Duration,
        batch_size: usize,
        retry: RetryConfig,
    ) -> Self {
        Self {
            scheduler,
            registry,
            interval,
            batch_size,
            retry,
        }
    }

    /// Spawns the poll loop, which runs until the token is cancelled.
    pub(crate) fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    /// Runs the poll loop.
    async fn run(self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut chunks = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, Vec<String>> = HashMap::new();
        let mut describing: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(res) = chunks.join_next_with_id(), if !chunks.is_empty() => {
                    let id = match res {
                        Ok((id, ())) => id,
                        Err(e) => {
                            error!("job status poll failed: {e}");
                            e.id()
                        }
                    };

                    for job in in_flight.remove(&id).unwrap_or_default() {
                        describing.remove(&job);
                    }
                }
                _ = interval.tick() => {
                    let live = self
                        .registry
                        .live_ids()
                        .into_iter()
                        .filter(|id| !describing.contains(id))
                        .collect::<Vec<_>>();

                    if live.is_empty() {
                        continue;
                    }

                    trace!(jobs = live.len(), "polling job status");
                    for chunk in live.chunks(self.batch_size) {
                        let chunk = chunk.to_vec();
                        describing.extend(chunk.iter().cloned());
                        let handle = chunks.spawn(describe_chunk(
                            self.scheduler.clone(),
                            self.registry.clone(),
                            self.retry.clone(),
                            chunk.clone(),
                        ));
                        in_flight.insert(handle.id(), chunk);
                    }
                }
            }
        }

        chunks.shutdown().await;
        debug!("job poller stopped");
    }
}

/// Describes one chunk of jobs and publishes the observations.
async fn describe_chunk(
    scheduler: Arc<dyn BatchScheduler>,
    registry: Arc<JobRegistry>,
    retry: RetryConfig,
    ids: Vec<String>,
) {
    let scheduler = &*scheduler;
    let request = &ids;
    let descriptions = match with_retry(&retry, "job status query", move || async move {
        scheduler.describe(request).await
    })
    .await
    {
        Ok(descriptions) => descriptions,
        Err(e) => {
            error!(jobs = ids.len(), "failed to query job status: {e}");
            for id in &ids {
                registry.fail(id, e.clone());
            }
            return;
        }
    };

    let mut seen = HashSet::with_capacity(descriptions.len());
    for description in &descriptions {
        seen.insert(description.id.as_str());
        if let Some(status) = registry.observe(description) {
            debug!(
                job_id = description.id,
                task = registry.key(&description.id),
                state = %status.state,
                "job state changed"
            );
        }
    }

    for id in ids.iter().filter(|id| !seen.contains(id.as_str())) {
        warn!(job_id = id, "job was not found by the scheduler; keeping its last state");
    }
}
