//! Implementation of the `run` subcommand.
//!
//! Runs inside the workflow job: creates the run directory on the shared
//! filesystem, opens the AWS Batch task backend, runs the engine there with
//! the backend serving its tasks, and stages the outputs.

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wdl_batch::AwsBatchScheduler;
use wdl_batch::BatchBackend;
use wdl_batch::logs::CloudWatchLogs;
use wdl_batch::run::DEFAULT_ENGINE;
use wdl_batch::run::Runner;
use wdl_batch::run::WorkflowRun;
use wdl_batch::scratch::CleanupPolicy;
use wdl_batch::scratch::ScratchCoordinator;
use wdl_batch::stage::OutputStager;
use wdl_batch::stage::s3::S3ObjectStore;
use wdl_batch::submit::workflow_stem;

use super::BatchArgs;
use super::connect;
use super::interrupted;

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Arguments shared with the `submit` command.
    #[command(flatten)]
    pub batch: BatchArgs,

    /// Uploads the run directory beneath the given `s3://` prefix.
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

    /// Runs the built-in self test workflow.
    #[arg(long, env = "SPROCKET_BATCH__SELF_TEST", conflicts_with = "args")]
    pub self_test: bool,

    /// The engine executable.
    #[arg(long, env = "SPROCKET_BATCH__ENGINE", value_name = "PATH", default_value = DEFAULT_ENGINE)]
    pub engine: String,

    /// The arguments passed to the engine's `run` command.
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "ARGS",
        required_unless_present = "self_test"
    )]
    pub args: Vec<String>,
}

/// Handles the `run` subcommand, returning the engine's exit code.
///
/// The task queue and shared filesystem are taken from the environment the
/// `submit` command gives the workflow job.
pub async fn run(args: Args) -> Result<i32> {
    let mut config = args.batch.load()?;
    let sdk = connect(&mut config).await?;

    let scratch = ScratchCoordinator::new(config.dir(), config.cleanup);
    let run = WorkflowRun::new(
        &workflow_stem(&args.args, args.self_test),
        &scratch,
        args.upload.as_deref(),
    )
    .context("invalid upload location")?;

    let stager = run.upload().map(|uri| {
        info!(destination = %uri, "outputs will be uploaded");
        OutputStager::new(Arc::new(S3ObjectStore::new(&sdk)))
    });

    let backend = Arc::new(BatchBackend::open(
        Arc::new(config),
        run.clone(),
        Arc::new(AwsBatchScheduler::new(&sdk)),
        Arc::new(CloudWatchLogs::new(&sdk)),
    )?);

    let runner = Runner::builder()
        .engine(args.engine)
        .args(args.args)
        .self_test(args.self_test)
        .backend(backend.clone())
        .maybe_stager(stager)
        .maybe_delete_after(args.delete_after)
        .build();

    let token = CancellationToken::new();
    let interrupt = tokio::spawn({
        let token = token.clone();
        async move {
            interrupted().await;
            token.cancel();
        }
    });

    let outcome = runner.run(&run, token).await;
    interrupt.abort();
    backend.close().await;

    Ok(outcome?.exit_code)
}
