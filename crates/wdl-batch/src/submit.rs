//! Submission of a whole workflow invocation as one remote job.
//!
//! The workflow job runs `sprocket-batch run` (see [`crate::run`]) on the
//! shared filesystem, which runs the engine and submits a task job for every
//! task the engine schedules. The submitting process either detaches, waits
//! for the workflow job or waits while streaming its log.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use bon::Builder;
use chrono::Utc;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::driver::DriverError;
use crate::driver::JobDriver;
use crate::job::FargateOptions;
use crate::job::Fingerprint;
use crate::job::JobHandle;
use crate::job::JobSpec;
use crate::job::JobStatus;
use crate::job::MAX_JOB_NAME_LEN;
use crate::job::MountPoint;
use crate::job::Resources;
use crate::logs::LogFollower;
use crate::logs::LogForwarder;
use crate::run::END_OF_LOG;
use crate::run::EXIT_INTERRUPTED;
use crate::run::EXIT_NO_CODE;
use crate::scratch::CleanupPolicy;

/// The prefix of the environment variables configuring `sprocket-batch`.
pub const ENV_PREFIX: &str = "SPROCKET_BATCH__";

/// The exit code of a submission or configuration error.
pub const EXIT_SUBMISSION: i32 = 78;

/// The exit code of an infrastructure failure.
pub const EXIT_INFRASTRUCTURE: i32 = 69;

/// The prefix of workflow job names.
const JOB_NAME_PREFIX: &str = "sprocket_batch_";

/// The default interval between log reads in follow mode.
const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// The default grace period for straggling log events.
const DEFAULT_LOG_GRACE: Duration = Duration::from_secs(3);

/// Variables that only configure the submitting process and are therefore
/// not passed through to the workflow job.
const LAUNCH_ONLY_VARS: &[&str] = &[
    "WORKFLOW_QUEUE",
    "IMAGE",
    "NAME",
    "CPU",
    "MEMORY_GIB",
    "WAIT",
    "FOLLOW",
    "NO_ENV",
    "SELF_TEST",
    "UPLOAD",
    "DELETE_AFTER",
    "DIR",
    "RUN_NAME",
    "RUN_DIR",
    "CONFIG",
    "TASK_SOCKET",
];

/// How the submitter behaves after submitting the workflow job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Print the job id and return.
    Detach,
    /// Wait for the job to finish and mirror its exit code.
    Wait,
    /// As [`SubmitMode::Wait`], streaming the job's log meanwhile.
    Follow,
}

/// Derives a short name of a workflow invocation from the file stem of the
/// workflow source (the first pass-through argument that is not an option).
pub fn workflow_stem(args: &[String], self_test: bool) -> String {
    if self_test {
        return "self_test".to_string();
    }

    args.iter()
        .find(|a| !a.starts_with('-'))
        .and_then(|source| {
            let source = source.rsplit('/').next().unwrap_or(source);
            Path::new(source)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "workflow".to_string())
}

/// Derives the display name of a workflow job.
///
/// An explicit name wins over the stem of the workflow source.
pub fn workflow_job_name(name: Option<&str>, args: &[String], self_test: bool) -> String {
    let stem = match name {
        Some(name) => name.to_string(),
        None => workflow_stem(args, self_test),
    };

    let mut name = format!("{JOB_NAME_PREFIX}{stem}");
    name.truncate(
        name.char_indices()
            .nth(MAX_JOB_NAME_LEN)
            .map(|(i, _)| i)
            .unwrap_or(name.len()),
    );
    name
}

/// Collects the environment variables passed through to the workflow job.
///
/// Every variable with the `SPROCKET_BATCH__` prefix is passed except those
/// that only configure the submission itself.
pub fn passthrough_env(vars: impl IntoIterator<Item = (String, String)>) -> IndexMap<String, String> {
    let mut env = vars
        .into_iter()
        .filter(|(k, _)| {
            k.strip_prefix(ENV_PREFIX)
                .is_some_and(|name| !name.is_empty() && !LAUNCH_ONLY_VARS.contains(&name))
        })
        .collect::<IndexMap<_, _>>();
    env.sort_keys();
    env
}

/// Maps an error from a submission to the process exit code.
pub fn error_exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<DriverError>() {
        Some(e) if e.is_infrastructure() => EXIT_INFRASTRUCTURE,
        Some(DriverError::Cancelled(_)) => EXIT_INTERRUPTED,
        _ => EXIT_SUBMISSION,
    }
}

/// Maps the terminal status of the workflow job to the process exit code.
pub fn status_exit_code(status: &JobStatus) -> i32 {
    match status.exit_code() {
        Some(-1) | None => EXIT_NO_CODE,
        Some(code) => code,
    }
}

/// The description of a workflow invocation to run as a remote job.
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct WorkflowSubmission {
    /// The display name of the job.
    name: String,
    /// The queue of the workflow job.
    queue: String,
    /// The queue of the task jobs the workflow job submits.
    task_queue: String,
    /// The container image of the workflow job.
    image: String,
    /// The resources of the workflow job.
    resources: Resources,
    /// The shared filesystem mounted into the workflow job.
    mount: MountPoint,
    /// The directory holding run directories.
    dir: PathBuf,
    /// The upload prefix of the run's outputs.
    upload: Option<String>,
    /// When the run directory is deleted after uploading.
    delete_after: Option<CleanupPolicy>,
    /// Whether the job runs the built-in self test.
    #[builder(default)]
    self_test: bool,
    /// The arguments passed through to the engine.
    #[builder(default)]
    args: Vec<String>,
    /// The environment of the workflow job.
    #[builder(default)]
    environment: IndexMap<String, String>,
    /// The tags of the workflow job.
    #[builder(default)]
    tags: IndexMap<String, String>,
    /// Serverless options of the workflow job.
    fargate: Option<FargateOptions>,
}

impl WorkflowSubmission {
    /// Gets the display name of the job.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the command of the workflow job.
    pub fn command(&self) -> Vec<String> {
        let mut command = vec![
            "sprocket-batch".to_string(),
            "run".to_string(),
            "--dir".to_string(),
            self.dir.to_string_lossy().into_owned(),
        ];

        if let Some(upload) = &self.upload {
            command.push("--upload".to_string());
            command.push(upload.clone());
        }

        if let Some(policy) = self.delete_after {
            command.push("--delete-after".to_string());
            command.push(policy.to_string());
        }

        if self.self_test {
            command.push("--self-test".to_string());
        } else {
            command.push("--".to_string());
            command.extend(self.args.iter().cloned());
        }

        command
    }

    /// Gets the environment of the workflow job.
    ///
    /// The settings the in-job runner needs to submit task jobs are always
    /// included and take precedence over passed-through variables.
    pub fn environment(&self) -> IndexMap<String, String> {
        let mut env = self.environment.clone();
        env.insert(format!("{ENV_PREFIX}FS"), self.mount.filesystem.clone());
        if let Some(fsap) = &self.mount.access_point {
            env.insert(format!("{ENV_PREFIX}FSAP"), fsap.clone());
        }
        env.insert(
            format!("{ENV_PREFIX}MOUNT"),
            self.mount.container_path.to_string_lossy().into_owned(),
        );
        env.insert(format!("{ENV_PREFIX}TASK_QUEUE"), self.task_queue.clone());
        env
    }

    /// Builds the job specification of the workflow job.
    ///
    /// Every call yields a distinct fingerprint: each invocation is a new
    /// workflow run.
    pub fn job_spec(&self) -> JobSpec {
        let fingerprint = Fingerprint::new(
            &Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            &self.name,
            0,
        );

        JobSpec::builder()
            .name(fingerprint.job_name(&self.name))
            .queue(self.queue.as_str())
            .image(self.image.as_str())
            .command(self.command())
            .resources(self.resources)
            .mounts(vec![self.mount.clone()])
            .environment(self.environment())
            .tags(self.tags.clone())
            .maybe_fargate(self.fargate.clone())
            .fingerprint(fingerprint)
            .build()
    }
}

/// The outcome of a submission.
#[derive(Debug)]
pub struct SubmitOutcome {
    /// The handle of the workflow job.
    pub handle: JobHandle,
    /// The terminal status of the job; `None` when detached.
    pub status: Option<JobStatus>,
    /// The exit code the submitting process should exit with.
    pub exit_code: i32,
}

/// Submits workflow jobs and optionally waits for them.
#[derive(Builder)]
pub struct Submitter<'a> {
    /// The job driver to submit with.
    driver: &'a JobDriver,
    /// The log forwarder; required for follow mode.
    logs: Option<&'a LogForwarder>,
    /// The interval between log reads in follow mode.
    #[builder(default = DEFAULT_LOG_INTERVAL)]
    log_interval: Duration,
    /// How long to keep reading the log for stragglers after the job is
    /// terminal.
    #[builder(default = DEFAULT_LOG_GRACE)]
    grace: Duration,
    /// Whether the job id is also printed to stderr.
    #[builder(default)]
    echo_id: bool,
}

impl Submitter<'_> {
    /// Submits the workflow job and behaves according to the mode.
    ///
    /// The job id is written to `out` when detached; the job's log lines are
    /// written to `log` when following.
    pub async fn submit<W: Write + Send, L: Write + Send>(
        &self,
        submission: &WorkflowSubmission,
        mode: SubmitMode,
        token: &CancellationToken,
        out: &mut W,
        log: &mut L,
    ) -> Result<SubmitOutcome> {
        let spec = submission.job_spec();
        info!(
            image = spec.image(),
            queue = spec.queue(),
            command = ?spec.command(),
            env = ?spec.environment().keys().collect::<Vec<_>>(),
            "submitting workflow job"
        );

        let handle = self.driver.submit(spec).await?;
        info!(job_id = %handle, name = handle.name(), "submitted workflow job");
        if self.echo_id {
            eprintln!("submitted workflow job `{handle}`");
        }

        let status = match mode {
            SubmitMode::Detach => {
                writeln!(out, "{handle}").context("failed to write job id")?;
                return Ok(SubmitOutcome {
                    handle,
                    status: None,
                    exit_code: 0,
                });
            }
            SubmitMode::Follow if self.logs.is_some() => self.follow(&handle, token, log).await?,
            SubmitMode::Follow | SubmitMode::Wait => {
                if mode == SubmitMode::Follow {
                    warn!("no log source is available; waiting without following");
                }
                self.driver.await_terminal(&handle, token, None).await?
            }
        };

        let exit_code = status_exit_code(&status);
        match &status.failure {
            Some(failure) => warn!(job_id = %handle, "workflow job failed: {failure}"),
            None => info!(job_id = %handle, state = %status.state, "workflow job finished"),
        }

        self.driver.release(&handle);
        if let Some(logs) = self.logs {
            logs.forget(&handle);
        }

        Ok(SubmitOutcome {
            handle,
            status: Some(status),
            exit_code,
        })
    }

    /// Waits for the job while streaming its log to `log`.
    async fn follow<L: Write + Send>(
        &self,
        handle: &JobHandle,
        token: &CancellationToken,
        log: &mut L,
    ) -> Result<JobStatus> {
        let mut stream = LogStream::default();
        let mut ticker = tokio::time::interval(self.log_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let terminal = self.driver.await_terminal(handle, token, None);
        tokio::pin!(terminal);

        let status = loop {
            tokio::select! {
                biased;
                res = &mut terminal => break res?,
                _ = ticker.tick() => self.drain(handle, &mut stream, log).await?,
            }
        };

        // Collect events that arrive after the job's state changed
        let deadline = tokio::time::Instant::now() + self.grace;
        loop {
            self.drain(handle, &mut stream, log).await?;
            if stream.ended || tokio::time::Instant::now() >= deadline {
                break;
            }

            tokio::time::sleep(self.log_interval.min(self.grace)).await;
        }

        if !stream.ended {
            match stream.follower.as_ref().map(LogFollower::stream) {
                Some(id) => warn!(
                    "the end of the workflow job's log was not seen; the complete log is in \
                     stream `{id}`"
                ),
                None => warn!(job_id = %handle, "the workflow job did not report a log stream"),
            }
        }

        Ok(status)
    }

    /// Writes the log events appended since the last read to `log`.
    ///
    /// Read errors are logged and retried on the next call.
    async fn drain<L: Write + Send>(
        &self,
        handle: &JobHandle,
        stream: &mut LogStream,
        log: &mut L,
    ) -> Result<()> {
        let Some(logs) = self.logs else {
            return Ok(());
        };

        if stream.follower.is_none() {
            let Ok(status) = self.driver.poll(handle) else {
                return Ok(());
            };

            let Some(id) = logs.resolve(handle, &status) else {
                return Ok(());
            };

            info!(job_id = %handle, log_stream = %id, "following workflow job log");
            stream.follower = Some(logs.follow(id));
        }

        let Some(follower) = stream.follower.as_mut() else {
            return Ok(());
        };

        match follower.next_batch().await {
            Ok(events) => {
                for event in events {
                    if event.message.trim_end() == END_OF_LOG {
                        stream.ended = true;
                    }

                    writeln!(log, "{message}", message = event.message.trim_end_matches('\n'))
                        .context("failed to write log")?;
                }
                log.flush().context("failed to write log")?;
            }
            Err(e) => debug!("{e}; retrying"),
        }

        Ok(())
    }
}

/// The state of a followed log.
#[derive(Default)]
struct LogStream {
    /// The follower, once the stream is known.
    follower: Option<LogFollower>,
    /// Whether the end-of-log marker was seen.
    ended: bool,
}
