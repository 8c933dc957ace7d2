//! Implementation of the `submit` subcommand.
//!
//! Submits a workflow invocation as a single AWS Batch job that runs
//! `sprocket-batch run` on the shared filesystem.

use std::io::IsTerminal;
use std::io::stderr;
use std::io::stdout;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wdl_batch::AwsBatchScheduler;
use wdl_batch::DriverError;
use wdl_batch::JobDriver;
use wdl_batch::job::FargateOptions;
use wdl_batch::job::MountPoint;
use wdl_batch::job::Resources;
use wdl_batch::logs::CloudWatchLogs;
use wdl_batch::logs::LogForwarder;
use wdl_batch::run::EXIT_INTERRUPTED;
use wdl_batch::scratch::CleanupPolicy;
use wdl_batch::submit::SubmitMode;
use wdl_batch::submit::Submitter;
use wdl_batch::submit::WorkflowSubmission;
use wdl_batch::submit::passthrough_env;
use wdl_batch::submit::workflow_job_name;

use super::BatchArgs;
use super::connect;
use super::interrupted;

/// Arguments for the `submit` subcommand.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Arguments shared with the `run` command.
    #[command(flatten)]
    pub batch: BatchArgs,

    /// The job queue for the workflow job (default is the task queue).
    #[arg(long, env = "SPROCKET_BATCH__WORKFLOW_QUEUE", value_name = "QUEUE")]
    pub workflow_queue: Option<String>,

    /// The container image of the workflow job.
    #[arg(long, env = "SPROCKET_BATCH__IMAGE", value_name = "IMAGE")]
    pub image: Option<String>,

    /// The name of the workflow job (default is derived from the workflow
    /// source).
    #[arg(long, env = "SPROCKET_BATCH__NAME", value_name = "NAME")]
    pub name: Option<String>,

    /// The vCPUs of the workflow job (default is 2).
    #[arg(long, env = "SPROCKET_BATCH__CPU", value_name = "CPU")]
    pub cpu: Option<f64>,

    /// The memory of the workflow job, in GiB (default is 4).
    #[arg(long, env = "SPROCKET_BATCH__MEMORY_GIB", value_name = "GIB")]
    pub memory_gib: Option<f64>,

    /// Uploads the run directory beneath the given `s3://` prefix.
    ///
    /// A prefix ending with `/` is used as is; otherwise the run name is
    /// appended.
    #[arg(long, env = "SPROCKET_BATCH__UPLOAD", value_name = "URI")]
    pub upload: Option<String>,

    /// Deletes the run directory after a complete upload.
    #[arg(
        long,
        env = "SPROCKET_BATCH__DELETE_AFTER",
        value_name = "POLICY",
        requires = "upload"
    )]
    pub delete_after: Option<CleanupPolicy>,

    /// Waits for the workflow job and exits with its exit code.
    #[arg(short, long, env = "SPROCKET_BATCH__WAIT")]
    pub wait: bool,

    /// Waits for the workflow job while streaming its log.
    #[arg(short, long, env = "SPROCKET_BATCH__FOLLOW")]
    pub follow: bool,

    /// Does not pass `SPROCKET_BATCH__*` environment variables through to
    /// the workflow job.
    #[arg(long, env = "SPROCKET_BATCH__NO_ENV")]
    pub no_env: bool,

    /// Runs the built-in self test workflow.
    #[arg(long, env = "SPROCKET_BATCH__SELF_TEST", conflicts_with = "args")]
    pub self_test: bool,

    /// The arguments passed to the engine's `run` command (the workflow
    /// source followed by its inputs).
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "ARGS",
        required_unless_present = "self_test"
    )]
    pub args: Vec<String>,
}

impl Args {
    /// Gets the mode of the submission.
    fn mode(&self) -> SubmitMode {
        if self.follow {
            SubmitMode::Follow
        } else if self.wait {
            SubmitMode::Wait
        } else {
            SubmitMode::Detach
        }
    }
}

/// Handles the `submit` subcommand, returning the process exit code.
pub async fn submit(args: Args) -> Result<i32> {
    let mode = args.mode();
    let mut config = args.batch.load()?;
    config.workflow_queue = args.workflow_queue.or(config.workflow_queue);
    config.workflow.image = args.image.or(config.workflow.image);
    config.workflow.cpu = args.cpu.or(config.workflow.cpu);
    config.workflow.memory_gib = args.memory_gib.or(config.workflow.memory_gib);

    let sdk = connect(&mut config).await?;

    let task_queue = config
        .task_queue
        .clone()
        .context("a task queue is required")?;
    let queue = config
        .workflow_queue()
        .map(str::to_string)
        .unwrap_or_else(|| task_queue.clone());
    let filesystem = config.fs.clone().context("an EFS filesystem is required")?;

    let scheduler = Arc::new(AwsBatchScheduler::new(&sdk));
    let role_arn = match config.workflow.role_arn.clone() {
        Some(arn) => Some(arn),
        None => scheduler
            .workflow_role(&queue)
            .await
            .with_context(|| format!("failed to read the workflow role of queue `{queue}`"))?,
    };

    let environment = if args.no_env {
        Default::default()
    } else {
        passthrough_env(std::env::vars())
    };

    let submission = WorkflowSubmission::builder()
        .name(workflow_job_name(
            args.name.as_deref(),
            &args.args,
            args.self_test,
        ))
        .queue(queue.as_str())
        .task_queue(task_queue)
        .image(config.workflow.image())
        .resources(Resources {
            vcpus: config.workflow.cpu(),
            memory_mib: (config.workflow.memory_gib() * 1024.0).ceil() as u64,
        })
        .mount(MountPoint {
            filesystem,
            access_point: config.fsap.clone(),
            container_path: config.mount(),
        })
        .dir(config.dir())
        .maybe_upload(args.upload)
        .maybe_delete_after(args.delete_after)
        .self_test(args.self_test)
        .args(args.args)
        .environment(environment)
        .tags(config.tags.clone())
        .maybe_fargate(role_arn.map(|role_arn| FargateOptions {
            role_arn,
            assign_public_ip: config.workflow.assign_public_ip,
        }))
        .build();

    info!(
        name = submission.name(),
        queue,
        image = config.workflow.image(),
        "submitting workflow"
    );

    let driver = JobDriver::open(scheduler, &config);
    let logs = LogForwarder::new(config.log_group(), Arc::new(CloudWatchLogs::new(&sdk)));
    let submitter = Submitter::builder()
        .driver(&driver)
        .logs(&logs)
        .log_interval(config.poll.interval())
        .echo_id(!stdout().is_terminal())
        .build();

    let token = CancellationToken::new();
    let interrupt = tokio::spawn({
        let token = token.clone();
        async move {
            interrupted().await;
            token.cancel();
        }
    });

    let result = submitter
        .submit(&submission, mode, &token, &mut stdout(), &mut stderr())
        .await;
    interrupt.abort();
    driver.close().await;

    match result {
        Ok(outcome) => Ok(outcome.exit_code),
        Err(e) => match e.downcast_ref::<DriverError>() {
            Some(DriverError::Cancelled(id)) => {
                eprintln!(
                    "{warning}: interrupted; the workflow job `{id}` may remain active (stop it \
                     with `aws batch terminate-job --job-id {id} --reason interrupted`)",
                    warning = if std::io::stderr().is_terminal() {
                        "warning".yellow().bold()
                    } else {
                        "warning".normal()
                    }
                );
                Ok(EXIT_INTERRUPTED)
            }
            _ => Err(e),
        },
    }
}
