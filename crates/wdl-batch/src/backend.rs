//! Implementation of the batch task execution backend.
//!
//! This is the boundary between the workflow engine and the job driver: the
//! engine hands the backend one task attempt at a time and receives exactly
//! one result per attempt.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use bon::Builder;
use indexmap::IndexMap;
use tokio::sync::oneshot;
use tokio::sync::oneshot::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::config::BatchConfig;
use crate::driver::DriverError;
use crate::driver::JobDriver;
use crate::job::FailureDetail;
use crate::job::Fingerprint;
use crate::job::JobHandle;
use crate::job::JobSpec;
use crate::job::JobState;
use crate::job::JobStatus;
use crate::job::MountPoint;
use crate::job::Resources;
use crate::logs::LogForwarder;
use crate::logs::LogSource;
use crate::logs::LogStreamId;
use crate::run::WorkflowRun;
use crate::scheduler::BatchScheduler;
use crate::scratch::ScratchCoordinator;
use crate::scratch::ScratchPath;

/// One gibibyte (GiB) as a float.
const ONE_GIBIBYTE: f64 = 1024.0 * 1024.0 * 1024.0;

/// One mebibyte (MiB).
const ONE_MEBIBYTE: u64 = 1024 * 1024;

/// The minimum memory of a task job, in MiB.
const MIN_MEMORY_MIB: u64 = 1024;

/// The number of poll intervals to wait for a cancelled job to stop.
const STOP_TIMEOUT_POLLS: u32 = 60;

/// The tag naming the run a job belongs to.
const RUN_TAG: &str = "sprocket-batch-run";

/// Represents a request to spawn a task attempt.
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct TaskSpawnRequest {
    /// The identifier of the task within the run (e.g. `call-hello`).
    id: String,
    /// The attempt number, starting at `0`.
    #[builder(default)]
    attempt: u64,
    /// The evaluated command of the task.
    command: String,
    /// The container image; the configured default is used if `None`.
    image: Option<String>,
    /// The requested number of CPUs.
    #[builder(default = 1.0)]
    cpu: f64,
    /// The requested memory, in bytes.
    #[builder(default = 2 * ONE_MEBIBYTE * 1024)]
    memory: u64,
    /// The environment variables of the task.
    #[builder(default)]
    env: IndexMap<String, String>,
    /// The maximum duration of the attempt; the configured default is used
    /// if `None`.
    timeout: Option<Duration>,
}

impl TaskSpawnRequest {
    /// Gets the identifier of the task.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Gets the attempt number.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Gets the evaluated command.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Gets the requested number of CPUs.
    pub fn cpu(&self) -> f64 {
        self.cpu
    }

    /// Gets the requested memory, in bytes.
    pub fn memory(&self) -> u64 {
        self.memory
    }

    /// Gets the environment variables of the task.
    pub fn env(&self) -> &IndexMap<String, String> {
        &self.env
    }
}

/// Represents the result of a task attempt.
#[derive(Debug)]
pub struct TaskExecutionResult {
    /// The id of the remote job that ran the attempt.
    pub job_id: String,
    /// The terminal state of the job.
    pub state: JobState,
    /// The exit code of the attempt.
    ///
    /// This is `-1` if the job did not produce one (e.g. it was cancelled or
    /// its host was reclaimed).
    pub exit_code: i32,
    /// Details about the failure, if the attempt failed.
    pub failure: Option<FailureDetail>,
    /// Whether the attempt was stopped after exceeding its timeout.
    pub timed_out: bool,
    /// The scratch directory of the attempt.
    pub scratch: ScratchPath,
    /// The log stream of the job, if the job produced one.
    pub log_stream: Option<LogStreamId>,
}

impl TaskExecutionResult {
    /// Determines if the attempt succeeded.
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Succeeded && !self.timed_out
    }
}

/// Represents a task execution backend.
pub trait TaskExecutionBackend: Send + Sync {
    /// Gets the maximum concurrent tasks supported by the backend.
    fn max_concurrency(&self) -> u64;

    /// Gets the scratch directory of the given task attempt.
    fn scratch_path(&self, id: &str, attempt: u64) -> ScratchPath;

    /// Spawns a task attempt with the execution backend.
    ///
    /// Upon success, returns a receiver for receiving the result; exactly one
    /// result is sent per spawned attempt.
    fn spawn(
        &self,
        request: TaskSpawnRequest,
        token: CancellationToken,
    ) -> Result<Receiver<Result<TaskExecutionResult>>>;
}

/// Runs task attempts as AWS Batch jobs that share a mounted filesystem.
pub struct BatchBackend {
    /// The batch configuration.
    config: Arc<BatchConfig>,
    /// The run the backend executes tasks for.
    run: Arc<WorkflowRun>,
    /// The job driver.
    driver: Arc<JobDriver>,
    /// The scratch coordinator.
    scratch: Arc<ScratchCoordinator>,
    /// The log forwarder.
    logs: Arc<LogForwarder>,
    /// The queue of task jobs.
    queue: String,
    /// The shared filesystem mounted into every task job.
    mount: MountPoint,
}

impl BatchBackend {
    /// Opens the backend for a run, starting its job driver.
    ///
    /// The configuration is expected to have already been validated and to
    /// have its filesystem resolved.
    pub fn open(
        config: Arc<BatchConfig>,
        run: WorkflowRun,
        scheduler: Arc<dyn BatchScheduler>,
        logs: Arc<dyn LogSource>,
    ) -> Result<Self> {
        let Some(queue) = config.task_queue.clone() else {
            bail!("configuration value `task_queue` is required");
        };

        let Some(filesystem) = config.fs.clone() else {
            bail!("configuration value `fs` is required");
        };

        info!(run = run.name(), queue, "initializing batch backend");

        let mount = MountPoint {
            filesystem,
            access_point: config.fsap.clone(),
            container_path: config.mount(),
        };

        Ok(Self {
            driver: Arc::new(JobDriver::open(scheduler, &config)),
            scratch: Arc::new(ScratchCoordinator::new(config.dir(), config.cleanup)),
            logs: Arc::new(LogForwarder::new(config.log_group(), logs)),
            run: Arc::new(run),
            config,
            queue,
            mount,
        })
    }

    /// Stops the backend's job driver.
    pub async fn close(&self) {
        self.driver.close().await;
    }

    /// Gets the job driver of the backend.
    pub fn driver(&self) -> &JobDriver {
        &self.driver
    }

    /// Gets the log forwarder of the backend.
    pub fn logs(&self) -> &LogForwarder {
        &self.logs
    }

    /// Gets the run of the backend.
    pub fn run(&self) -> &WorkflowRun {
        &self.run
    }

    /// Checks the requested resources against the configured limits.
    fn check_resources(&self, request: &TaskSpawnRequest) -> Result<()> {
        let max_cpu = self.config.task.max_cpu();
        if request.cpu > max_cpu {
            bail!(
                "task `{id}` requires {cpu} CPU{s}, but the execution backend has a maximum of \
                 {max_cpu}",
                id = request.id,
                cpu = request.cpu,
                s = if request.cpu == 1.0 { "" } else { "s" },
            );
        }

        let memory = request.memory as f64 / ONE_GIBIBYTE;
        let max_memory = self.config.task.max_memory_gib();
        if memory > max_memory {
            bail!(
                "task `{id}` requires {memory} GiB of memory, but the execution backend has a \
                 maximum of {max_memory} GiB",
                id = request.id,
            );
        }

        Ok(())
    }

    /// Builds the job specification of a task attempt.
    fn job_spec(&self, request: &TaskSpawnRequest, scratch: &ScratchPath) -> Result<JobSpec> {
        let root = scratch.root().to_string_lossy();
        let root = shlex::try_quote(&root).with_context(|| {
            format!("scratch path `{root}` cannot be quoted for the shell")
        })?;

        let fingerprint = Fingerprint::new(self.run.name(), &request.id, request.attempt);
        let mut tags = self.config.tags.clone();
        tags.insert(RUN_TAG.to_string(), self.run.name().to_string());

        Ok(JobSpec::builder()
            .name(fingerprint.job_name(&request.id))
            .queue(self.queue.as_str())
            .image(
                request
                    .image
                    .as_deref()
                    .unwrap_or_else(|| self.config.task.image()),
            )
            .command(vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                format!(
                    "cd {root}/work && bash ../command >> ../stdout.txt 2> >(tee -a \
                     ../stderr.txt >&2)"
                ),
            ])
            .resources(Resources {
                vcpus: request.cpu,
                memory_mib: request.memory.div_ceil(ONE_MEBIBYTE).max(MIN_MEMORY_MIB),
            })
            .mounts(vec![self.mount.clone()])
            .environment(request.env.clone())
            .tags(tags)
            .maybe_timeout(request.timeout.or(self.config.task.timeout()))
            .fingerprint(fingerprint)
            .build())
    }
}

impl TaskExecutionBackend for BatchBackend {
    fn max_concurrency(&self) -> u64 {
        // The scheduler queues jobs without limit
        u64::MAX
    }

    fn scratch_path(&self, id: &str, attempt: u64) -> ScratchPath {
        self.scratch.path(self.run.name(), id, attempt)
    }

    fn spawn(
        &self,
        request: TaskSpawnRequest,
        token: CancellationToken,
    ) -> Result<Receiver<Result<TaskExecutionResult>>> {
        self.check_resources(&request)?;

        let scratch = self
            .scratch
            .assign(self.run.name(), &request.id, request.attempt)?;

        let command = scratch.command();
        fs::write(&command, &request.command).with_context(|| {
            format!(
                "failed to write command contents to `{path}`",
                path = command.display()
            )
        })?;

        for path in [scratch.stdout(), scratch.stderr()] {
            fs::File::create(&path).with_context(|| {
                format!("failed to create `{path}`", path = path.display())
            })?;
        }

        let attempt = TaskAttempt {
            spec: self.job_spec(&request, &scratch)?,
            timeout: request.timeout.or(self.config.task.timeout()),
            stop_timeout: self.config.poll.interval() * STOP_TIMEOUT_POLLS,
            id: request.id,
            driver: self.driver.clone(),
            coordinator: self.scratch.clone(),
            logs: self.logs.clone(),
            scratch,
        };

        let (completed_tx, completed_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = attempt.run(token).await;
            // The engine may have stopped listening
            let _ = completed_tx.send(result);
        });

        Ok(completed_rx)
    }
}

/// One task attempt being run as a remote job.
struct TaskAttempt {
    /// The identifier of the task.
    id: String,
    /// The job specification of the attempt.
    spec: JobSpec,
    /// The maximum duration of the attempt.
    timeout: Option<Duration>,
    /// How long to wait for the job to stop after cancelling it.
    stop_timeout: Duration,
    /// The job driver.
    driver: Arc<JobDriver>,
    /// The scratch coordinator.
    coordinator: Arc<ScratchCoordinator>,
    /// The log forwarder.
    logs: Arc<LogForwarder>,
    /// The scratch directory of the attempt.
    scratch: ScratchPath,
}

impl TaskAttempt {
    /// Runs the attempt until its job reaches a terminal state.
    ///
    /// The job is released from the driver on every path once it was
    /// submitted.
    async fn run(self, token: CancellationToken) -> Result<TaskExecutionResult> {
        let handle = self
            .driver
            .submit(self.spec.clone())
            .await
            .with_context(|| format!("failed to submit task `{id}`", id = self.id))?;

        self.driver.registry().set_key(handle.id(), &self.id);
        info!(task_id = self.id, job_id = %handle, "task job submitted");

        let outcome = self.execute(&handle, &token).await;
        let log_stream = outcome
            .as_ref()
            .ok()
            .and_then(|(status, _)| self.logs.resolve(&handle, status));
        self.logs.forget(&handle);
        self.driver.release(&handle);

        let (status, timed_out) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // The job's fate is unknown, so its scratch is treated like a failure's
                self.coordinator.cleanup(&self.scratch, JobState::Failed);
                return Err(e);
            }
        };

        if let Some(stream) = &log_stream {
            info!(task_id = self.id, job_id = %handle, log_stream = %stream, "task log stream");
        }

        let exit_code = status.exit_code().unwrap_or(-1);
        match (&status.failure, status.state) {
            (Some(failure), _) => warn!(task_id = self.id, job_id = %handle, "task failed: {failure}"),
            (None, state) => info!(task_id = self.id, job_id = %handle, %state, exit_code, "task finished"),
        }

        let state = if timed_out {
            JobState::Failed
        } else {
            status.state
        };
        self.coordinator.cleanup(&self.scratch, state);

        Ok(TaskExecutionResult {
            job_id: handle.id().to_string(),
            state: status.state,
            exit_code,
            failure: status.failure,
            timed_out,
            scratch: self.scratch,
            log_stream,
        })
    }

    /// Waits for the job, stopping it when the attempt is cancelled or times
    /// out.
    ///
    /// Returns the terminal status and whether the attempt timed out.
    async fn execute(
        &self,
        handle: &JobHandle,
        token: &CancellationToken,
    ) -> Result<(JobStatus, bool)> {
        match self.driver.await_terminal(handle, token, self.timeout).await {
            Ok(status) => Ok((status, false)),
            Err(DriverError::Cancelled(_)) => {
                info!(task_id = self.id, job_id = %handle, "task cancelled");
                Ok((self.stop(handle).await?, false))
            }
            Err(DriverError::TimedOut { timeout, .. }) => {
                warn!(task_id = self.id, job_id = %handle, ?timeout, "task timed out");
                Ok((self.stop(handle).await?, true))
            }
            Err(e) => {
                Err(e).with_context(|| format!("failed to execute task `{id}`", id = self.id))
            }
        }
    }

    /// Cancels the job and waits, at most the stop timeout, for its terminal
    /// state.
    async fn stop(&self, handle: &JobHandle) -> Result<JobStatus> {
        self.driver
            .cancel(handle)
            .await
            .with_context(|| format!("failed to cancel task `{id}`", id = self.id))?;

        self.driver
            .await_terminal(handle, &CancellationToken::new(), Some(self.stop_timeout))
            .await
            .with_context(|| format!("failed to stop task `{id}`", id = self.id))
    }
}
