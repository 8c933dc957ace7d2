//! Workflow runs and the runner executed inside the workflow job.
//!
//! The workflow job runs the engine in a fresh run directory on the shared
//! filesystem, serving its task execution backend to the engine (see
//! [`crate::service`]) so that every task runs as its own job. It then
//! stages the run's outputs when an upload prefix is configured and finally
//! prints [`END_OF_LOG`] so that followers know the log is complete.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use bon::Builder;
use chrono::DateTime;
use chrono::Utc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::backend::TaskExecutionBackend;
use crate::backend::TaskSpawnRequest;
use crate::scratch::CleanupPolicy;
use crate::scratch::ScratchCoordinator;
use crate::service::TASK_SOCKET_ENV;
use crate::service::TaskService;
use crate::stage::OutputStager;
use crate::stage::StageError;
use crate::stage::StageReport;
use crate::stage::UploadUri;

/// The line printed as the last line of a workflow job's log.
pub const END_OF_LOG: &str = "[sprocket-batch] -- END OF LOG --";

/// The default engine executable.
pub const DEFAULT_ENGINE: &str = "sprocket";

/// The name of the directory, within a run directory, receiving the engine's
/// outputs.
pub const OUTPUT_DIR_NAME: &str = "output";

/// The environment variable naming the current run.
pub const RUN_NAME_ENV: &str = "SPROCKET_BATCH__RUN_NAME";

/// The environment variable holding the current run directory.
pub const RUN_DIR_ENV: &str = "SPROCKET_BATCH__RUN_DIR";

/// The exit code reported when the engine exits without a code.
pub const EXIT_NO_CODE: i32 = 255;

/// The exit code reported when the run is interrupted.
pub const EXIT_INTERRUPTED: i32 = 130;

/// The number of task attempts run by the self test.
const SELF_TEST_TASKS: u64 = 2;

/// The command of every self test task.
const SELF_TEST_COMMAND: &str = r#"echo "hello from $(hostname)"
df -h .
"#;

/// Generates the name of a run started at the given time.
///
/// Names sort chronologically: `%Y%m%d_%H%M%S_<name>`.
pub fn run_name(started: DateTime<Utc>, name: &str) -> String {
    format!("{time}_{name}", time = started.format("%Y%m%d_%H%M%S"))
}

/// A workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    /// The name of the run.
    name: String,
    /// The run directory.
    dir: PathBuf,
    /// Where the run's outputs are uploaded, if anywhere.
    upload: Option<UploadUri>,
}

impl WorkflowRun {
    /// Starts a new run named after the current time and the given name.
    pub fn new(
        name: &str,
        scratch: &ScratchCoordinator,
        upload_prefix: Option<&str>,
    ) -> Result<Self, StageError> {
        Self::with_name(run_name(Utc::now(), name), scratch, upload_prefix)
    }

    /// Constructs a run with an exact run name.
    pub fn with_name(
        name: String,
        scratch: &ScratchCoordinator,
        upload_prefix: Option<&str>,
    ) -> Result<Self, StageError> {
        let upload = upload_prefix
            .map(|prefix| UploadUri::resolve(prefix, &name))
            .transpose()?;

        Ok(Self {
            dir: scratch.run_dir(&name),
            name,
            upload,
        })
    }

    /// Gets the name of the run.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the run directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Gets the directory receiving the engine's outputs.
    pub fn output_dir(&self) -> PathBuf {
        self.dir.join(OUTPUT_DIR_NAME)
    }

    /// Gets the upload location of the run's outputs.
    pub fn upload(&self) -> Option<&UploadUri> {
        self.upload.as_ref()
    }
}

/// The outcome of a run.
#[derive(Debug)]
pub struct RunOutcome {
    /// The exit code of the run.
    pub exit_code: i32,
    /// The staging report, if outputs were staged.
    pub report: Option<StageReport>,
}

/// Runs the engine for a workflow run inside the workflow job.
///
/// With a backend, the engine's task launches are served by it for as long
/// as the engine runs.
#[derive(Builder)]
#[builder(on(String, into))]
pub struct Runner {
    /// The engine executable.
    #[builder(default = DEFAULT_ENGINE.to_string())]
    engine: String,
    /// The arguments passed through to the engine's `run` command.
    #[builder(default)]
    args: Vec<String>,
    /// Whether to run the built-in self test instead of the engine.
    #[builder(default)]
    self_test: bool,
    /// The backend running the engine's tasks.
    backend: Option<Arc<dyn TaskExecutionBackend>>,
    /// The stager of outputs; required to upload.
    stager: Option<OutputStager>,
    /// When the run directory is deleted after staging.
    delete_after: Option<CleanupPolicy>,
}

impl Runner {
    /// Executes the run.
    ///
    /// Staging failures are logged but never change the exit code, which is
    /// the engine's own exit code (or the self test's).
    pub async fn run(&self, run: &WorkflowRun, token: CancellationToken) -> Result<RunOutcome> {
        fs::create_dir_all(run.dir()).with_context(|| {
            format!(
                "failed to create run directory `{path}`",
                path = run.dir().display()
            )
        })?;

        info!(run = run.name(), dir = %run.dir().display(), "starting workflow run");

        let exit_code = if self.self_test {
            let Some(backend) = &self.backend else {
                bail!("the self test requires a task execution backend");
            };
            self_test(backend.as_ref(), &token).await?
        } else {
            self.run_engine(run, &token).await?
        };

        info!(run = run.name(), exit_code, "workflow run finished");

        let report = match (&self.stager, run.upload()) {
            (Some(stager), Some(uri)) => match stager.stage(run.dir(), uri).await {
                Ok(report) => {
                    info!(
                        uploaded = report.uploaded.len(),
                        failed = report.failed.len(),
                        destination = %uri,
                        "staged run outputs"
                    );
                    Some(report)
                }
                Err(e) => {
                    error!("failed to stage run outputs: {e}");
                    None
                }
            },
            _ => None,
        };

        let staged = report.as_ref().is_some_and(StageReport::is_complete);
        if let Some(policy) = self.delete_after
            && staged
            && policy.applies(exit_code == 0)
        {
            match fs::remove_dir_all(run.dir()) {
                Ok(()) => info!(dir = %run.dir().display(), "deleted run directory"),
                Err(e) => warn!(
                    dir = %run.dir().display(),
                    error = %e,
                    "failed to delete run directory"
                ),
            }
        }

        eprintln!("{END_OF_LOG}");
        Ok(RunOutcome { exit_code, report })
    }

    /// Runs the engine, serving the backend to it while it runs.
    async fn run_engine(&self, run: &WorkflowRun, token: &CancellationToken) -> Result<i32> {
        let mut args = vec!["run".to_string()];
        args.extend(self.args.iter().cloned());
        args.push("--output".to_string());
        args.push(run.output_dir().to_string_lossy().into_owned());

        let mut command = Command::new(&self.engine);
        command
            .args(&args)
            .current_dir(run.dir())
            .env(RUN_NAME_ENV, run.name())
            .env(RUN_DIR_ENV, run.dir())
            .kill_on_drop(true);

        let stop = CancellationToken::new();
        let service = match &self.backend {
            Some(backend) => {
                let service = TaskService::bind(backend.clone())?;
                command.env(TASK_SOCKET_ENV, service.socket());
                Some(tokio::spawn(service.serve(stop.clone())))
            }
            None => None,
        };

        let exit_code = self.wait_engine(command, token).await;

        // Attempts the engine left behind are cancelled with the service
        stop.cancel();
        if let Some(service) = service
            && let Err(e) = service.await
        {
            error!("task service failed: {e}");
        }

        exit_code
    }

    /// Spawns the engine and waits for it to exit, killing it when the run is
    /// interrupted.
    async fn wait_engine(&self, mut command: Command, token: &CancellationToken) -> Result<i32> {
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{engine}`", engine = self.engine))?;

        let exit_code = tokio::select! {
            status = child.wait() => status_code(status.with_context(|| {
                format!("failed to wait for `{engine}`", engine = self.engine)
            })?),
            _ = token.cancelled() => {
                warn!("workflow run interrupted; stopping the engine");
                if let Err(e) = child.kill().await {
                    error!("failed to stop the engine: {e}");
                }
                EXIT_INTERRUPTED
            }
        };

        info!(engine = self.engine, exit_code, "engine exited");
        Ok(exit_code)
    }
}

/// Runs the built-in self test: concurrent task attempts through the backend,
/// each reporting its host and the shared filesystem it sees.
///
/// Returns `0` if every attempt succeeded, otherwise the exit code of the
/// first failed attempt.
async fn self_test(backend: &dyn TaskExecutionBackend, token: &CancellationToken) -> Result<i32> {
    info!(tasks = SELF_TEST_TASKS, "running the self test");

    let receivers = (0..SELF_TEST_TASKS)
        .map(|n| {
            backend.spawn(
                TaskSpawnRequest::builder()
                    .id(format!("self-test-{n}"))
                    .command(SELF_TEST_COMMAND)
                    .build(),
                token.clone(),
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let mut exit_code = 0;
    for rx in receivers {
        let result = rx.await.context("a self test task was abandoned")??;
        info!(
            job_id = result.job_id,
            state = %result.state,
            exit_code = result.exit_code,
            scratch = %result.scratch.root().display(),
            "self test task finished"
        );

        if !result.succeeded() && exit_code == 0 {
            exit_code = if result.exit_code > 0 {
                result.exit_code
            } else {
                EXIT_NO_CODE
            };
        }
    }

    if token.is_cancelled() {
        return Ok(EXIT_INTERRUPTED);
    }

    Ok(exit_code)
}

/// Gets the exit code to report for an engine's exit status.
fn status_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_NO_CODE)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn run_names_are_timestamped() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(run_name(at, "hello"), "20240101_120000_hello");
    }

    #[test]
    fn run_resolves_upload() {
        let scratch = ScratchCoordinator::new("/mnt/efs/runs", CleanupPolicy::default());
        let run = WorkflowRun::with_name(
            "20240101_120000_hello".to_string(),
            &scratch,
            Some("s3://bucket/out"),
        )
        .unwrap();

        assert_eq!(run.dir(), Path::new("/mnt/efs/runs/20240101_120000_hello"));
        assert_eq!(
            run.upload().unwrap().to_string(),
            "s3://bucket/out/20240101_120000_hello/"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runner_reports_engine_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchCoordinator::new(dir.path(), CleanupPolicy::default());
        let run = WorkflowRun::with_name("run".to_string(), &scratch, None).unwrap();

        let runner = Runner::builder().engine("false").build();
        let outcome = runner.run(&run, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.exit_code, 1);
        assert!(outcome.report.is_none());
        assert!(run.dir().is_dir());
    }
}
