//! Representation of remote batch jobs.
//!
//! A job moves through the states of [`JobState`] in order:
//!
//! ```text
//! SUBMITTED -> RUNNABLE -> STARTING -> RUNNING -> SUCCEEDED | FAILED
//!      \___________\___________\__________\____-> CANCELLED
//! ```
//!
//! Observations are merged with [`JobState::advance`], which never lets a
//! job move backwards or leave a terminal state.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bon::Builder;
use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

/// The maximum length of a remote job name.
pub const MAX_JOB_NAME_LEN: usize = 128;

/// The number of fingerprint hex digits appended to a job name.
const JOB_NAME_FINGERPRINT_LEN: usize = 16;

/// The reason given to the scheduler when a job is cancelled.
///
/// Schedulers report a cancelled job as failed; a failure carrying this
/// reason is observed as [`JobState::Cancelled`].
pub const CANCEL_REASON: &str = "cancelled by sprocket-batch";

/// A stable identifier for a unit of remote work.
///
/// The fingerprint is derived from the identity of a task (its scope, usually
/// the run name, and its task id) and the attempt number. Submitting two job
/// specifications with the same fingerprint results in a single remote job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derives the fingerprint of the given attempt of a task.
    pub fn new(scope: &str, task_id: &str, attempt: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(scope.as_bytes());
        hasher.update(&[0]);
        hasher.update(task_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(&attempt.to_le_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    /// Gets the fingerprint as a hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives a remote job name from a display name and this fingerprint.
    ///
    /// Characters the scheduler does not accept are replaced with `_` and the
    /// display name is truncated so the result never exceeds
    /// [`MAX_JOB_NAME_LEN`]. Because the suffix comes from the fingerprint,
    /// the same fingerprint always yields the same job name.
    pub fn job_name(&self, display: &str) -> String {
        let max = MAX_JOB_NAME_LEN - JOB_NAME_FINGERPRINT_LEN - 1;
        let mut name: String = display
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .take(max)
            .collect();

        if name.is_empty() {
            name.push_str("job");
        }

        format!("{name}-{suffix}", suffix = &self.0[..JOB_NAME_FINGERPRINT_LEN])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents the state of a remote job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// The job was accepted by the scheduler.
    Submitted,
    /// The job is waiting for compute capacity.
    Runnable,
    /// The job's container is being started.
    Starting,
    /// The job is running.
    Running,
    /// The job exited successfully.
    Succeeded,
    /// The job failed.
    Failed,
    /// The job was cancelled before it could finish.
    Cancelled,
}

impl JobState {
    /// Determines if the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// The position of the state along the forward ordering.
    fn rank(self) -> u8 {
        match self {
            Self::Submitted => 0,
            Self::Runnable => 1,
            Self::Starting => 2,
            Self::Running => 3,
            Self::Succeeded | Self::Failed | Self::Cancelled => 4,
        }
    }

    /// Merges a newly observed state into the current state.
    ///
    /// Terminal states are sticky and a non-terminal state only moves forward;
    /// an observation that would move the job backwards is ignored.
    pub fn advance(self, observed: Self) -> Self {
        if self.is_terminal() {
            return self;
        }

        if observed.rank() >= self.rank() {
            observed
        } else {
            self
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Runnable => write!(f, "RUNNABLE"),
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUBMITTED" | "PENDING" => Ok(Self::Submitted),
            "RUNNABLE" => Ok(Self::Runnable),
            "STARTING" => Ok(Self::Starting),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("unknown job status `{s}`")),
        }
    }
}

/// The compute resources requested for a job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// The number of vCPUs.
    pub vcpus: f64,
    /// The memory, in mebibytes.
    pub memory_mib: u64,
}

/// A shared filesystem mounted into a job's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    /// The identifier of the filesystem (e.g. `fs-1234`).
    pub filesystem: String,
    /// The access point to mount through, if any (e.g. `fsap-1234`).
    pub access_point: Option<String>,
    /// The path at which the filesystem is mounted in the container.
    pub container_path: PathBuf,
}

/// Options for jobs that run on serverless (Fargate) capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FargateOptions {
    /// The role used both to launch and to run the job.
    pub role_arn: String,
    /// Whether the job is assigned a public IP address.
    pub assign_public_ip: bool,
}

/// The logical description of a unit of remote work.
///
/// A specification is immutable once built.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(on(String, into))]
pub struct JobSpec {
    /// The remote job name.
    name: String,
    /// The queue to submit the job to.
    queue: String,
    /// The container image to run.
    image: String,
    /// The command (program and arguments) to run in the container.
    command: Vec<String>,
    /// The requested compute resources.
    resources: Resources,
    /// The shared filesystems to mount.
    #[builder(default)]
    mounts: Vec<MountPoint>,
    /// The environment variables of the container.
    #[builder(default)]
    environment: IndexMap<String, String>,
    /// The tags applied to the remote job.
    #[builder(default)]
    tags: IndexMap<String, String>,
    /// The maximum duration of one attempt of the job, enforced remotely.
    timeout: Option<Duration>,
    /// Serverless options; `None` for jobs on managed instances.
    fargate: Option<FargateOptions>,
    /// The fingerprint used to deduplicate submissions.
    fingerprint: Fingerprint,
}

impl JobSpec {
    /// Gets the remote job name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the queue the job is submitted to.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Gets the container image.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Gets the container command.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Gets the requested resources.
    pub fn resources(&self) -> Resources {
        self.resources
    }

    /// Gets the mounted filesystems.
    pub fn mounts(&self) -> &[MountPoint] {
        &self.mounts
    }

    /// Gets the container environment.
    pub fn environment(&self) -> &IndexMap<String, String> {
        &self.environment
    }

    /// Gets the tags of the remote job.
    pub fn tags(&self) -> &IndexMap<String, String> {
        &self.tags
    }

    /// Gets the per-attempt timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Gets the serverless options.
    pub fn fargate(&self) -> Option<&FargateOptions> {
        self.fargate.as_ref()
    }

    /// Gets the fingerprint of the job.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

/// A handle to a submitted remote job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    /// The scheduler-assigned job identifier.
    id: String,
    /// The remote job name.
    name: String,
    /// The queue the job was submitted to.
    queue: String,
    /// The fingerprint of the submitted specification.
    fingerprint: Fingerprint,
    /// When the job was submitted (or adopted).
    submitted_at: DateTime<Utc>,
}

impl JobHandle {
    /// Constructs a handle for a job submitted from the given specification.
    pub fn new(id: impl Into<String>, spec: &JobSpec) -> Self {
        Self {
            id: id.into(),
            name: spec.name.clone(),
            queue: spec.queue.clone(),
            fingerprint: spec.fingerprint.clone(),
            submitted_at: Utc::now(),
        }
    }

    /// Gets the scheduler-assigned job identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Gets the remote job name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the queue the job was submitted to.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Gets the fingerprint of the job.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Gets the submission timestamp.
    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Details about why a job failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// The exit code of the job's container, if it exited.
    pub exit_code: Option<i32>,
    /// The reason reported for the container.
    pub reason: Option<String>,
    /// The reason reported for the job's status.
    pub status_reason: Option<String>,
    /// The log stream of the job.
    pub log_stream: Option<String>,
    /// Whether the job was interrupted by the infrastructure (e.g. a spot
    /// instance was reclaimed) rather than failing on its own.
    pub interrupted: bool,
}

impl FailureDetail {
    /// Builds the failure detail from what the scheduler reported.
    pub fn from_description(description: &JobDescription) -> Self {
        let interrupted = description
            .status_reason
            .as_deref()
            .map(|r| r.contains("Host EC2") && r.contains("terminated"))
            .unwrap_or(false);

        Self {
            exit_code: description.exit_code,
            reason: description.reason.clone(),
            status_reason: description.status_reason.clone(),
            log_stream: description.log_stream.clone(),
            interrupted,
        }
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "exited with code {code}")?,
            None if self.interrupted => write!(f, "interrupted by the infrastructure")?,
            None => write!(f, "failed without an exit code")?,
        }

        if let Some(reason) = self.status_reason.as_deref().or(self.reason.as_deref()) {
            write!(f, ": {reason}")?;
        }

        Ok(())
    }
}

/// A job as described by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescription {
    /// The scheduler-assigned job identifier.
    pub id: String,
    /// The reported state.
    pub state: JobState,
    /// The exit code of the container, if it exited.
    pub exit_code: Option<i32>,
    /// The reason reported for the container.
    pub reason: Option<String>,
    /// The reason reported for the job's status.
    pub status_reason: Option<String>,
    /// The log stream receiving the container's output, once known.
    pub log_stream: Option<String>,
}

impl JobDescription {
    /// Constructs a description with only an id and state.
    pub fn new(id: impl Into<String>, state: JobState) -> Self {
        Self {
            id: id.into(),
            state,
            exit_code: None,
            reason: None,
            status_reason: None,
            log_stream: None,
        }
    }
}

/// An observation of a job's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    /// The observed state.
    pub state: JobState,
    /// The failure detail; only present for failed jobs.
    pub failure: Option<FailureDetail>,
    /// The log stream of the job, once known.
    pub log_stream: Option<String>,
}

impl JobStatus {
    /// The status of a job that has just been submitted.
    pub fn submitted() -> Self {
        Self {
            state: JobState::Submitted,
            failure: None,
            log_stream: None,
        }
    }

    /// Merges a scheduler description into this status.
    ///
    /// Returns `true` if the state changed.
    pub fn merge(&mut self, description: &JobDescription) -> bool {
        if description.log_stream.is_some() && self.log_stream.is_none() {
            self.log_stream = description.log_stream.clone();
        }

        let previous = self.state;
        self.state = previous.advance(description.state);
        if self.state == previous {
            return false;
        }

        if self.state == JobState::Failed {
            self.failure = Some(FailureDetail::from_description(description));
        }

        true
    }

    /// The exit code the job should be reported with.
    ///
    /// Returns `None` while the job is not terminal.
    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            JobState::Succeeded => Some(0),
            JobState::Failed => Some(
                self.failure
                    .as_ref()
                    .and_then(|f| f.exit_code)
                    .filter(|c| *c != 0)
                    .unwrap_or(-1),
            ),
            JobState::Cancelled => Some(-1),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const ALL: [JobState; 7] = [
        JobState::Submitted,
        JobState::Runnable,
        JobState::Starting,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Cancelled,
    ];

    #[test]
    fn terminal_states_never_regress() {
        for current in ALL.into_iter().filter(|s| s.is_terminal()) {
            for observed in ALL {
                assert_eq!(current.advance(observed), current);
            }
        }
    }

    #[test]
    fn non_terminal_states_only_move_forward() {
        assert_eq!(
            JobState::Running.advance(JobState::Runnable),
            JobState::Running
        );
        assert_eq!(
            JobState::Submitted.advance(JobState::Starting),
            JobState::Starting
        );
        assert_eq!(
            JobState::Runnable.advance(JobState::Succeeded),
            JobState::Succeeded
        );
    }

    #[test]
    fn any_non_terminal_state_may_be_cancelled() {
        for current in ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert_eq!(current.advance(JobState::Cancelled), JobState::Cancelled);
        }
    }

    #[test]
    fn pending_maps_to_submitted() {
        assert_eq!("PENDING".parse::<JobState>().unwrap(), JobState::Submitted);
        assert!("BOGUS".parse::<JobState>().is_err());
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = Fingerprint::new("run", "call-hello", 1);
        assert_eq!(a, Fingerprint::new("run", "call-hello", 1));
        assert_ne!(a, Fingerprint::new("run", "call-hello", 2));
        assert_ne!(a, Fingerprint::new("run2", "call-hello", 1));
    }

    #[test]
    fn job_names_are_sanitized_and_bounded() {
        let fp = Fingerprint::new("run", "task", 0);
        let name = fp.job_name("hello.world/task");
        assert!(name.starts_with("hello_world_task-"));

        let long = fp.job_name(&"x".repeat(500));
        assert_eq!(long.len(), MAX_JOB_NAME_LEN);
        assert_eq!(long, fp.job_name(&"x".repeat(500)));
    }

    #[test]
    fn spot_termination_is_an_interruption() {
        let mut description = JobDescription::new("id", JobState::Failed);
        description.status_reason =
            Some("Host EC2 (instance i-123) terminated.".to_string());
        let detail = FailureDetail::from_description(&description);
        assert!(detail.interrupted);
        assert_eq!(detail.exit_code, None);
    }

    #[test]
    fn merge_records_failure_once() {
        let mut status = JobStatus::submitted();
        let mut failed = JobDescription::new("id", JobState::Failed);
        failed.exit_code = Some(3);
        failed.log_stream = Some("def/default/abc".to_string());

        assert!(status.merge(&failed));
        assert_eq!(status.exit_code(), Some(3));
        assert_eq!(status.log_stream.as_deref(), Some("def/default/abc"));

        // A late, stale observation does not change anything
        assert!(!status.merge(&JobDescription::new("id", JobState::Running)));
        assert_eq!(status.state, JobState::Failed);
    }
}
