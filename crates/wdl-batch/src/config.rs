//! Implementation of batch execution configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use anyhow::bail;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use tokio_retry2::strategy::ExponentialBackoff;

use crate::scheduler::DEFAULT_DESCRIBE_BATCH_SIZE;
use crate::scratch::CleanupPolicy;

/// The default mount point of the shared filesystem.
pub const DEFAULT_MOUNT: &str = "/mnt/efs";

/// The default name of the directory, beneath the mount, holding runs.
pub const DEFAULT_RUNS_DIR_NAME: &str = "sprocket_batch_run";

/// The default log group receiving job output.
pub const DEFAULT_LOG_GROUP: &str = "/aws/batch/job";

/// The default container image for tasks that do not specify one.
pub const DEFAULT_TASK_IMAGE: &str = "ubuntu:latest";

/// The default container image of the workflow job.
pub const DEFAULT_WORKFLOW_IMAGE: &str = "ghcr.io/stjude-rust-labs/sprocket:latest";

/// The default number of vCPUs of the workflow job.
pub const DEFAULT_WORKFLOW_CPU: f64 = 2.0;

/// The default memory of the workflow job, in GiB.
pub const DEFAULT_WORKFLOW_MEMORY_GIB: f64 = 4.0;

/// The default maximum vCPUs a task may request.
pub const DEFAULT_MAX_TASK_CPU: f64 = 64.0;

/// The default maximum memory a task may request, in GiB.
pub const DEFAULT_MAX_TASK_MEMORY_GIB: f64 = 244.0;

/// The default poll interval, in milliseconds.
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// The default initial retry delay, in milliseconds.
const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 50;

/// The default maximum retry delay, in milliseconds.
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 60_000;

/// The default number of retries of a transient failure.
const DEFAULT_RETRY_MAX_RETRIES: usize = 10;

/// Represents the configuration of batch execution.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct BatchConfig {
    /// The AWS region.
    ///
    /// Defaults to the region detected from the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// The job queue for task jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,
    /// The job queue for the workflow job.
    ///
    /// Defaults to the task queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_queue: Option<String>,
    /// The EFS filesystem id (e.g. `fs-1234`).
    ///
    /// Defaults to the filesystem of `fsap`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<String>,
    /// The EFS access point id (e.g. `fsap-1234`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsap: Option<String>,
    /// The path at which every job mounts the shared filesystem.
    ///
    /// Defaults to `/mnt/efs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<PathBuf>,
    /// The directory holding run directories; must be beneath `mount`.
    ///
    /// Defaults to `<mount>/sprocket_batch_run`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// The log group receiving job output.
    ///
    /// Defaults to `/aws/batch/job`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_group: Option<String>,
    /// Tags applied to every submitted job.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub tags: IndexMap<String, String>,
    /// The scratch cleanup policy of task attempts.
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    /// The minimum interval between job submissions, in milliseconds.
    ///
    /// Defaults to no throttling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_interval_ms: Option<u64>,
    /// Task job configuration.
    #[serde(default)]
    pub task: TaskJobConfig,
    /// Workflow job configuration.
    #[serde(default)]
    pub workflow: WorkflowJobConfig,
    /// Status polling configuration.
    #[serde(default)]
    pub poll: PollConfig,
    /// Retry configuration for transient scheduler errors.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl BatchConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        let mount = self.mount();
        if !mount.is_absolute() {
            bail!(
                "configuration value `mount` must be an absolute path (got `{mount}`)",
                mount = mount.display()
            );
        }

        let dir = self.dir();
        if !dir.starts_with(&mount) || dir == mount {
            bail!(
                "configuration value `dir` must be a directory beneath the mount `{mount}` (got \
                 `{dir}`)",
                mount = mount.display(),
                dir = dir.display()
            );
        }

        if let Some(0) = self.submit_interval_ms {
            bail!("configuration value `submit_interval_ms` cannot be zero");
        }

        self.task.validate()?;
        self.workflow.validate()?;
        self.poll.validate()?;
        self.retry.validate()?;
        Ok(())
    }

    /// Gets the mount point of the shared filesystem.
    pub fn mount(&self) -> PathBuf {
        self.mount
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNT))
    }

    /// Gets the directory holding run directories.
    pub fn dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| self.mount().join(DEFAULT_RUNS_DIR_NAME))
    }

    /// Gets the log group receiving job output.
    pub fn log_group(&self) -> &str {
        self.log_group.as_deref().unwrap_or(DEFAULT_LOG_GROUP)
    }

    /// Gets the job queue of the workflow job.
    pub fn workflow_queue(&self) -> Option<&str> {
        self.workflow_queue
            .as_deref()
            .or(self.task_queue.as_deref())
    }

    /// Gets the minimum interval between submissions.
    pub fn submit_interval(&self) -> Option<Duration> {
        self.submit_interval_ms.map(Duration::from_millis)
    }
}

/// Represents the configuration of task jobs.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct TaskJobConfig {
    /// The container image of tasks that do not specify one.
    ///
    /// Defaults to `ubuntu:latest`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// The maximum vCPUs a task may request.
    ///
    /// Defaults to `64`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu: Option<f64>,
    /// The maximum memory a task may request, in GiB.
    ///
    /// Defaults to `244`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_gib: Option<f64>,
    /// The maximum duration of one task attempt, in seconds.
    ///
    /// Defaults to no timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl TaskJobConfig {
    /// Validates the task job configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(cpu) = self.max_cpu
            && cpu <= 0.0
        {
            bail!("configuration value `task.max_cpu` must be greater than zero");
        }

        if let Some(memory) = self.max_memory_gib
            && memory <= 0.0
        {
            bail!("configuration value `task.max_memory_gib` must be greater than zero");
        }

        if let Some(0) = self.timeout_secs {
            bail!("configuration value `task.timeout_secs` cannot be zero");
        }

        Ok(())
    }

    /// Gets the default task container image.
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_TASK_IMAGE)
    }

    /// Gets the maximum vCPUs of a task.
    pub fn max_cpu(&self) -> f64 {
        self.max_cpu.unwrap_or(DEFAULT_MAX_TASK_CPU)
    }

    /// Gets the maximum memory of a task, in GiB.
    pub fn max_memory_gib(&self) -> f64 {
        self.max_memory_gib.unwrap_or(DEFAULT_MAX_TASK_MEMORY_GIB)
    }

    /// Gets the timeout of one task attempt.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Represents the configuration of the workflow job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct WorkflowJobConfig {
    /// The container image of the workflow job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// The vCPUs of the workflow job.
    ///
    /// Defaults to `2`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    /// The memory of the workflow job, in GiB.
    ///
    /// Defaults to `4`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_gib: Option<f64>,
    /// The IAM role the workflow job runs as.
    ///
    /// Defaults to the `WorkflowEngineRoleArn` tag of the workflow queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    /// Whether the workflow job is assigned a public IP address.
    #[serde(default = "default_true")]
    pub assign_public_ip: bool,
}

/// Used for serde defaults.
fn default_true() -> bool {
    true
}

impl Default for WorkflowJobConfig {
    fn default() -> Self {
        Self {
            image: None,
            cpu: None,
            memory_gib: None,
            role_arn: None,
            assign_public_ip: true,
        }
    }
}

impl WorkflowJobConfig {
    /// Validates the workflow job configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cpu() <= 0.0 {
            bail!("configuration value `workflow.cpu` must be greater than zero");
        }

        if self.memory_gib() <= 0.0 {
            bail!("configuration value `workflow.memory_gib` must be greater than zero");
        }

        Ok(())
    }

    /// Gets the workflow job image.
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_WORKFLOW_IMAGE)
    }

    /// Gets the vCPUs of the workflow job.
    pub fn cpu(&self) -> f64 {
        self.cpu.unwrap_or(DEFAULT_WORKFLOW_CPU)
    }

    /// Gets the memory of the workflow job, in GiB.
    pub fn memory_gib(&self) -> f64 {
        self.memory_gib.unwrap_or(DEFAULT_WORKFLOW_MEMORY_GIB)
    }
}

/// Represents the configuration of status polling.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct PollConfig {
    /// The interval between polls, in milliseconds.
    ///
    /// Defaults to `1000`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    /// The maximum number of jobs described by one request.
    ///
    /// Defaults to (and cannot exceed) `100`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

impl PollConfig {
    /// Validates the polling configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(0) = self.interval_ms {
            bail!("configuration value `poll.interval_ms` cannot be zero");
        }

        if let Some(size) = self.batch_size
            && !(1..=DEFAULT_DESCRIBE_BATCH_SIZE).contains(&size)
        {
            bail!(
                "configuration value `poll.batch_size` must be between 1 and \
                 {DEFAULT_DESCRIBE_BATCH_SIZE}"
            );
        }

        Ok(())
    }

    /// Gets the interval between polls.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS))
    }

    /// Gets the maximum number of jobs described by one request.
    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_DESCRIBE_BATCH_SIZE)
    }
}

/// Represents the configuration of retries.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct RetryConfig {
    /// The delay before the first retry, in milliseconds.
    ///
    /// Defaults to `50`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_ms: Option<u64>,
    /// The maximum delay between retries, in milliseconds.
    ///
    /// Defaults to `60000`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    /// The maximum number of retries.
    ///
    /// Defaults to `10`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<usize>,
}

impl RetryConfig {
    /// Validates the retry configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(0) = self.initial_delay_ms {
            bail!("configuration value `retry.initial_delay_ms` cannot be zero");
        }

        if self.max_delay_ms() < self.initial_delay_ms() {
            bail!(
                "configuration value `retry.max_delay_ms` cannot be less than \
                 `retry.initial_delay_ms`"
            );
        }

        Ok(())
    }

    /// Gets the initial retry delay, in milliseconds.
    pub fn initial_delay_ms(&self) -> u64 {
        self.initial_delay_ms
            .unwrap_or(DEFAULT_RETRY_INITIAL_DELAY_MS)
    }

    /// Gets the maximum retry delay, in milliseconds.
    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms.unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS)
    }

    /// Gets the maximum number of retries.
    pub fn max_retries(&self) -> usize {
        self.max_retries.unwrap_or(DEFAULT_RETRY_MAX_RETRIES)
    }

    /// Gets the backoff strategy described by this configuration.
    pub fn strategy(&self) -> impl Iterator<Item = Duration> + use<> {
        ExponentialBackoff::from_millis(self.initial_delay_ms())
            .max_delay_millis(self.max_delay_ms())
            .take(self.max_retries())
    }
}
