//! Scripted fakes of the remote services used by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use anyhow::bail;
use async_trait::async_trait;
use tokio::time::Instant;
use wdl_batch::BatchConfig;
use wdl_batch::JobSpec;
use wdl_batch::JobState;
use wdl_batch::SchedulerError;
use wdl_batch::job::CANCEL_REASON;
use wdl_batch::job::JobDescription;
use wdl_batch::logs::LogError;
use wdl_batch::logs::LogEvent;
use wdl_batch::logs::LogSource;
use wdl_batch::scheduler::BatchScheduler;
use wdl_batch::stage::ObjectStore;

/// Builds a configuration with fast polling and retries.
pub fn config(dir: &Path) -> BatchConfig {
    toml::from_str(&format!(
        r#"
task_queue = "tasks"
workflow_queue = "workflows"
fs = "fs-1234"
mount = "{mount}"
dir = "{dir}"

[poll]
interval_ms = 5

[retry]
initial_delay_ms = 1
max_delay_ms = 2
max_retries = 3
"#,
        mount = dir.display(),
        dir = dir.join("runs").display(),
    ))
    .expect("test configuration should parse")
}

/// Builds the states a job moves through, one per describe call.
pub fn script(states: &[JobState], exit_code: Option<i32>) -> Vec<(JobState, Option<i32>)> {
    let last = states.len().saturating_sub(1);
    states
        .iter()
        .enumerate()
        .map(|(i, s)| (*s, if i == last { exit_code } else { None }))
        .collect()
}

/// The script followed by default: the job succeeds after running.
pub fn succeeds() -> Vec<(JobState, Option<i32>)> {
    script(
        &[JobState::Runnable, JobState::Running, JobState::Succeeded],
        Some(0),
    )
}

/// A script where the job keeps running until it is cancelled.
pub fn runs_forever() -> Vec<(JobState, Option<i32>)> {
    script(&[JobState::Runnable, JobState::Running], None)
}

/// Chooses the script of a job from its specification.
type Scripter = Box<dyn Fn(&JobSpec) -> Vec<(JobState, Option<i32>)> + Send + Sync>;

/// A job known to the fake scheduler.
struct FakeJob {
    /// The submitted specification.
    spec: JobSpec,
    /// The states still to be reported.
    pending: VecDeque<(JobState, Option<i32>)>,
    /// The currently reported description.
    current: JobDescription,
}

/// The mutable state of the fake scheduler.
#[derive(Default)]
struct State {
    /// The jobs, by id.
    jobs: HashMap<String, FakeJob>,
    /// The number of calls to `submit`.
    submit_calls: usize,
    /// The number of submissions whose response should be lost after the
    /// job was created.
    lost_responses: usize,
    /// The rejection of every submission, if any.
    reject: Option<String>,
    /// The number of describe calls that should fail transiently.
    describe_failures: usize,
    /// The largest number of ids in one describe call.
    max_describe: usize,
    /// The ids of terminated jobs.
    terminated: Vec<String>,
    /// Whether termination requests are rejected without effect.
    reject_terminations: bool,
    /// The number of find calls that should fail transiently.
    find_failures: usize,
    /// The number of calls to `find`.
    find_calls: usize,
    /// The times at which jobs were created.
    submit_times: Vec<Instant>,
}

/// A scheduler that moves jobs through scripted states.
///
/// Every describe call advances each described job by one scripted state.
pub struct FakeScheduler {
    /// The scheduler state.
    state: Mutex<State>,
    /// The script of new jobs.
    scripter: Scripter,
}

impl FakeScheduler {
    /// Constructs a scheduler where every job succeeds.
    pub fn new() -> Self {
        Self::scripted(|_| succeeds())
    }

    /// Constructs a scheduler choosing each job's script.
    pub fn scripted(
        scripter: impl Fn(&JobSpec) -> Vec<(JobState, Option<i32>)> + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Default::default(),
            scripter: Box::new(scripter),
        }
    }

    /// Loses the response of the next `n` submissions even though the jobs
    /// are created.
    pub fn lose_responses(&self, n: usize) {
        self.state.lock().unwrap().lost_responses = n;
    }

    /// Rejects every submission.
    pub fn reject(&self, message: &str) {
        self.state.lock().unwrap().reject = Some(message.to_string());
    }

    /// Rejects every termination request, leaving the jobs running.
    pub fn reject_terminations(&self) {
        self.state.lock().unwrap().reject_terminations = true;
    }

    /// Fails the next `n` find calls transiently.
    pub fn fail_finds(&self, n: usize) {
        self.state.lock().unwrap().find_failures = n;
    }

    /// Gets the number of calls to `find`.
    pub fn find_calls(&self) -> usize {
        self.state.lock().unwrap().find_calls
    }

    /// Gets the times at which jobs were created, in order.
    pub fn submit_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().submit_times.clone()
    }

    /// Fails the next `n` describe calls transiently.
    pub fn fail_describes(&self, n: usize) {
        self.state.lock().unwrap().describe_failures = n;
    }

    /// Gets the number of remote jobs created.
    pub fn jobs_created(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    /// Gets the number of calls to `submit`.
    pub fn submit_calls(&self) -> usize {
        self.state.lock().unwrap().submit_calls
    }

    /// Gets the largest number of jobs described in one call.
    pub fn max_describe(&self) -> usize {
        self.state.lock().unwrap().max_describe
    }

    /// Gets the ids of the jobs terminated so far.
    pub fn terminated(&self) -> Vec<String> {
        self.state.lock().unwrap().terminated.clone()
    }

    /// Gets the specification a job was submitted with.
    pub fn spec(&self, id: &str) -> Option<JobSpec> {
        self.state.lock().unwrap().jobs.get(id).map(|j| j.spec.clone())
    }

    /// Gets the specifications of every submitted job.
    pub fn specs(&self) -> Vec<JobSpec> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .values()
            .map(|j| j.spec.clone())
            .collect()
    }
}

#[async_trait]
impl BatchScheduler for FakeScheduler {
    async fn submit(&self, spec: &JobSpec) -> Result<String, SchedulerError> {
        let mut state = self.state.lock().unwrap();
        state.submit_calls += 1;
        if let Some(message) = &state.reject {
            return Err(SchedulerError::Rejected(message.clone()));
        }

        let id = format!("job-{n}", n = state.jobs.len() + 1);
        state.submit_times.push(Instant::now());
        state.jobs.insert(
            id.clone(),
            FakeJob {
                spec: spec.clone(),
                pending: (self.scripter)(spec).into(),
                current: JobDescription::new(&id, JobState::Submitted),
            },
        );

        if state.lost_responses > 0 {
            state.lost_responses -= 1;
            return Err(SchedulerError::Transient("connection reset".to_string()));
        }

        Ok(id)
    }

    async fn find(&self, queue: &str, name: &str) -> Result<Option<String>, SchedulerError> {
        let mut state = self.state.lock().unwrap();
        state.find_calls += 1;
        if state.find_failures > 0 {
            state.find_failures -= 1;
            return Err(SchedulerError::Transient("rate exceeded".to_string()));
        }

        Ok(state
            .jobs
            .iter()
            .find(|(_, j)| j.spec.queue() == queue && j.spec.name() == name)
            .map(|(id, _)| id.clone()))
    }

    async fn describe(&self, ids: &[String]) -> Result<Vec<JobDescription>, SchedulerError> {
        let mut state = self.state.lock().unwrap();
        state.max_describe = state.max_describe.max(ids.len());
        if state.describe_failures > 0 {
            state.describe_failures -= 1;
            return Err(SchedulerError::Transient("rate exceeded".to_string()));
        }

        let mut descriptions = Vec::new();
        for id in ids {
            let Some(job) = state.jobs.get_mut(id) else {
                continue;
            };

            if !job.current.state.is_terminal()
                && let Some((next, exit_code)) = job.pending.pop_front()
            {
                job.current.state = next;
                job.current.exit_code = exit_code;
                if matches!(next, JobState::Running | JobState::Succeeded | JobState::Failed) {
                    job.current.log_stream = Some(format!("default/{id}"));
                }
            }

            descriptions.push(job.current.clone());
        }

        Ok(descriptions)
    }

    async fn terminate(&self, id: &str, reason: &str) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().unwrap();
        if state.reject_terminations {
            return Err(SchedulerError::Rejected(format!("job `{id}` cannot be terminated")));
        }

        let Some(job) = state.jobs.get_mut(id) else {
            return Err(SchedulerError::Rejected(format!("job `{id}` does not exist")));
        };

        if !job.current.state.is_terminal() {
            assert_eq!(reason, CANCEL_REASON);
            job.pending.clear();
            job.pending.push_back((JobState::Cancelled, None));
        }

        state.terminated.push(id.to_string());
        Ok(())
    }
}

/// A log source serving fixed streams, failing every other read when flaky.
#[derive(Default)]
pub struct FakeLogSource {
    /// The events of each stream.
    streams: Mutex<HashMap<String, Vec<LogEvent>>>,
    /// Whether reads alternate between failing and succeeding.
    flaky: bool,
    /// The number of reads so far.
    reads: Mutex<usize>,
}

impl FakeLogSource {
    /// Constructs a source that fails every other read.
    pub fn flaky() -> Self {
        Self {
            flaky: true,
            ..Default::default()
        }
    }

    /// Appends lines to a stream.
    pub fn append(&self, stream: &str, lines: &[&str]) {
        let mut streams = self.streams.lock().unwrap();
        let events = streams.entry(stream.to_string()).or_default();
        for line in lines {
            let n = events.len() as i64;
            events.push(LogEvent {
                id: format!("{stream}-{n}"),
                // Pairs of events share a timestamp
                timestamp: 1_000 + n / 2,
                message: line.to_string(),
            });
        }
    }
}

#[async_trait]
impl LogSource for FakeLogSource {
    async fn fetch(
        &self,
        _group: &str,
        stream: &str,
        start_time: Option<i64>,
    ) -> Result<Vec<LogEvent>, LogError> {
        {
            let mut reads = self.reads.lock().unwrap();
            *reads += 1;
            if self.flaky && *reads % 2 == 1 {
                return Err(LogError {
                    stream: stream.to_string(),
                    message: "connection closed".to_string(),
                });
            }
        }

        let streams = self.streams.lock().unwrap();
        Ok(streams
            .get(stream)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| start_time.is_none_or(|t| e.timestamp >= t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// An object store recording uploads.
#[derive(Default)]
pub struct FakeObjectStore {
    /// The uploaded object URIs.
    pub objects: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        if !path.is_file() {
            bail!("`{path}` is not a file", path = path.display());
        }

        self.objects
            .lock()
            .unwrap()
            .push(format!("s3://{bucket}/{key}"));
        Ok(())
    }
}
