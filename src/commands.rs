//! Implementation of sprocket-batch CLI commands.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Args as ClapArgs;
use tokio::signal;
use tracing::error;
use tracing::info;
use wdl_batch::BatchConfig;
use wdl_batch::aws;
use wdl_batch::aws::SdkConfig;
use wdl_batch::scratch::CleanupPolicy;

use crate::config::Config;

pub mod run;
pub mod submit;
pub mod task;

/// Arguments shared by every command that talks to AWS Batch.
///
/// Each argument overrides the value from the configuration file.
#[derive(ClapArgs, Debug, Default)]
pub struct BatchArgs {
    /// The configuration file to read.
    #[arg(long, env = "SPROCKET_BATCH__CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// The AWS region; detected from the environment if not given.
    #[arg(long, env = "SPROCKET_BATCH__REGION", value_name = "REGION")]
    pub region: Option<String>,

    /// The job queue for task jobs.
    #[arg(long, env = "SPROCKET_BATCH__TASK_QUEUE", value_name = "QUEUE")]
    pub task_queue: Option<String>,

    /// The EFS filesystem id; resolved from `--fsap` if not given.
    #[arg(long, env = "SPROCKET_BATCH__FS", value_name = "ID")]
    pub fs: Option<String>,

    /// The EFS access point id.
    #[arg(long, env = "SPROCKET_BATCH__FSAP", value_name = "ID")]
    pub fsap: Option<String>,

    /// The path at which every job mounts the shared filesystem (default is
    /// `/mnt/efs`).
    #[arg(long, env = "SPROCKET_BATCH__MOUNT", value_name = "PATH")]
    pub mount: Option<PathBuf>,

    /// The directory holding run directories; must be beneath the mount
    /// (default is `<mount>/sprocket_batch_run`).
    #[arg(long, env = "SPROCKET_BATCH__DIR", value_name = "PATH")]
    pub dir: Option<PathBuf>,

    /// The log group receiving job output (default is `/aws/batch/job`).
    #[arg(long, env = "SPROCKET_BATCH__LOG_GROUP", value_name = "GROUP")]
    pub log_group: Option<String>,

    /// When the scratch directory of a task attempt is deleted.
    #[arg(long, env = "SPROCKET_BATCH__CLEANUP", value_name = "POLICY")]
    pub cleanup: Option<CleanupPolicy>,
}

impl BatchArgs {
    /// Applies the arguments over the given configuration.
    pub fn apply(self, mut config: BatchConfig) -> BatchConfig {
        config.region = self.region.or(config.region);
        config.task_queue = self.task_queue.or(config.task_queue);
        config.fs = self.fs.or(config.fs);
        config.fsap = self.fsap.or(config.fsap);
        config.mount = self.mount.or(config.mount);
        config.dir = self.dir.or(config.dir);
        config.log_group = self.log_group.or(config.log_group);
        if let Some(cleanup) = self.cleanup {
            config.cleanup = cleanup;
        }

        config
    }

    /// Loads the configuration file and applies the arguments over it.
    pub fn load(self) -> Result<BatchConfig> {
        let config = Config::load(self.config.as_deref())?;
        Ok(self.apply(config.batch))
    }
}

/// Loads the AWS configuration and resolves the shared filesystem.
///
/// The configuration must name a task queue and either a filesystem or an
/// access point.
pub async fn connect(config: &mut BatchConfig) -> Result<SdkConfig> {
    config.validate()?;

    if config.task_queue.is_none() {
        bail!("a task queue is required; use `--task-queue` or `SPROCKET_BATCH__TASK_QUEUE`");
    }

    let sdk = aws::load_config(config.region.as_deref()).await?;
    if config.fs.is_none() {
        let Some(fsap) = config.fsap.as_deref() else {
            bail!("an EFS filesystem is required; use `--fsap` or `--fs`");
        };

        let fs = aws::filesystem_for_access_point(&sdk, fsap)
            .await
            .context("failed to resolve the EFS filesystem")?;
        info!(fsap, fs, "resolved EFS filesystem");
        config.fs = Some(fs);
    }

    Ok(sdk)
}

/// Waits for an interrupt (Ctrl-C) or termination signal.
pub async fn interrupted() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
