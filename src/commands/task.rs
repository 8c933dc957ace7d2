//! Implementation of the `task` subcommand.
//!
//! Launches one task attempt through the task service of the enclosing
//! `sprocket-batch run`, so that the attempt runs as its own AWS Batch job.

use std::fs;
use std::io::Write;
use std::io::stdout;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use tracing::info;
use wdl_batch::run::EXIT_INTERRUPTED;
use wdl_batch::run::EXIT_NO_CODE;
use wdl_batch::service::TaskReply;
use wdl_batch::service::TaskRequest;
use wdl_batch::service::run_task;

use super::interrupted;

/// Parses a `KEY=VALUE` environment variable.
fn parse_env(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => bail!("environment variable `{s}` must be given as `KEY=VALUE`"),
    }
}

/// Arguments for the `task` subcommand.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// The socket of the task service.
    #[arg(long, env = "SPROCKET_BATCH__TASK_SOCKET", value_name = "PATH")]
    pub socket: PathBuf,

    /// The identifier of the task within the run.
    #[arg(long, value_name = "ID")]
    pub id: String,

    /// The attempt number, starting at 0.
    #[arg(long, default_value_t = 0, value_name = "N")]
    pub attempt: u64,

    /// The file holding the evaluated command of the task.
    #[arg(long, value_name = "PATH")]
    pub command: PathBuf,

    /// The container image (default is the configured task image).
    #[arg(long, value_name = "IMAGE")]
    pub image: Option<String>,

    /// The requested number of CPUs.
    #[arg(long, value_name = "CPU")]
    pub cpu: Option<f64>,

    /// The requested memory, in bytes.
    #[arg(long, value_name = "BYTES")]
    pub memory: Option<u64>,

    /// The maximum duration of the attempt, in seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// An environment variable of the task; may be repeated.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,
}

/// Handles the `task` subcommand, returning the attempt's exit code.
///
/// The reply of the task service is printed to stdout as JSON.
pub async fn task(args: Args) -> Result<i32> {
    let command = fs::read_to_string(&args.command).with_context(|| {
        format!(
            "failed to read task command `{path}`",
            path = args.command.display()
        )
    })?;

    let request = TaskRequest {
        id: args.id,
        attempt: args.attempt,
        command,
        image: args.image,
        cpu: args.cpu,
        memory: args.memory,
        env: args.env.into_iter().collect(),
        timeout_secs: args.timeout,
    };

    // Leaving early closes the connection, which cancels the attempt
    let reply = tokio::select! {
        reply = run_task(&args.socket, &request) => reply?,
        _ = interrupted() => return Ok(EXIT_INTERRUPTED),
    };

    let mut out = stdout();
    serde_json::to_writer(&mut out, &reply).context("failed to write task reply")?;
    writeln!(out).context("failed to write task reply")?;

    match reply {
        TaskReply::Finished {
            job_id,
            state,
            exit_code,
            ..
        } => {
            info!(task_id = request.id, job_id, state, exit_code, "task attempt finished");
            Ok(if exit_code < 0 { EXIT_NO_CODE } else { exit_code })
        }
        TaskReply::Failed { error } => {
            bail!("failed to run task `{id}`: {error}", id = request.id)
        }
    }
}
