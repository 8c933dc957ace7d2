//! The sprocket-batch command line tool.

use std::io::IsTerminal;
use std::io::stderr;

use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use git_testament::git_testament;
use git_testament::render_testament;
use sprocket_batch::commands;
use tracing_log::AsTrace;
use wdl_batch::submit::error_exit_code;

git_testament!(TESTAMENT);

#[derive(Subcommand)]
enum Commands {
    /// Submits a workflow to AWS Batch as a single workflow job.
    ///
    /// By default the job id is printed and the command exits immediately.
    /// With `--wait` the command exits with the workflow's exit code; with
    /// `--follow` it also streams the workflow job's log.
    Submit(commands::submit::Args),

    /// Runs a workflow inside a workflow job.
    ///
    /// Every task of the workflow is executed as its own AWS Batch job that
    /// shares the run directory through EFS: the engine launches each task
    /// with the `task` command.
    Run(commands::run::Args),

    /// Runs one task attempt of the enclosing `run` as an AWS Batch job.
    ///
    /// Prints the outcome as JSON and exits with the task's exit code.
    Task(commands::task::Args),
}

#[derive(Parser)]
#[command(author, version = render_testament!(TESTAMENT), propagate_version = true, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    verbose: Verbosity,
}

/// Runs the command line tool, returning the process exit code.
async fn inner() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    tracing_log::LogTracer::init()?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(cli.verbose.log_level_filter().as_trace())
        .with_writer(std::io::stderr)
        .with_ansi(stderr().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Submit(args) => commands::submit::submit(args).await,
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Task(args) => commands::task::task(args).await,
    }
}

#[tokio::main]
pub async fn main() {
    match inner().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{error}: {e:?}",
                error = if std::io::stderr().is_terminal() {
                    "error".red().bold()
                } else {
                    "error".normal()
                }
            );
            std::process::exit(error_exit_code(&e));
        }
    }
}
