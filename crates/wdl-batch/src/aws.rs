//! Shared support for the AWS service clients.

use std::error::Error as StdError;
use std::fmt::Debug;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use aws_config::BehaviorVersion;
use aws_config::Region;
pub use aws_config::SdkConfig;
use aws_sdk_batch::error::DisplayErrorContext;
use aws_sdk_batch::error::ProvideErrorMetadata;
use aws_sdk_batch::error::SdkError;
use tracing::debug;

use crate::scheduler::SchedulerError;

/// Service error codes that indicate a transient condition.
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "ThrottlingException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "ServerException",
    "ServiceUnavailable",
    "InternalError",
];

/// Loads the AWS SDK configuration from the environment.
///
/// If `region` is `None`, the region is detected with the SDK's default
/// provider chain (environment, profile, instance metadata).
pub async fn load_config(region: Option<&str>) -> Result<SdkConfig> {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region.to_string()));
    }

    let config = loader.load().await;
    match config.region() {
        Some(region) => debug!(%region, "loaded AWS configuration"),
        None => bail!(
            "failed to detect AWS region; configure the AWS CLI or set `AWS_DEFAULT_REGION`"
        ),
    }

    Ok(config)
}

/// Resolves the filesystem id of an EFS access point.
pub async fn filesystem_for_access_point(config: &SdkConfig, access_point: &str) -> Result<String> {
    let client = aws_sdk_efs::Client::new(config);
    let response = client
        .describe_access_points()
        .access_point_id(access_point)
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))
        .with_context(|| format!("failed to describe EFS access point `{access_point}`"))?;

    response
        .access_points()
        .first()
        .and_then(|ap| ap.file_system_id())
        .map(str::to_string)
        .with_context(|| format!("EFS access point `{access_point}` has no filesystem"))
}

/// Classifies an SDK error as transient or permanent.
///
/// Timeouts, dispatch failures, unparseable responses, throttling and
/// server-side errors are transient; everything else is a rejection.
pub(crate) fn classify<E>(err: SdkError<E>) -> SchedulerError
where
    E: ProvideErrorMetadata + StdError + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            let code = service.err().code().unwrap_or_default();
            if status == 429 || status >= 500 || TRANSIENT_ERROR_CODES.contains(&code) {
                SchedulerError::Transient(message)
            } else {
                SchedulerError::Rejected(message)
            }
        }
        SdkError::ConstructionFailure(_) => SchedulerError::Rejected(message),
        _ => SchedulerError::Transient(message),
    }
}

/// Formats an SDK error with its full context.
pub(crate) fn display<E, R>(err: &SdkError<E, R>) -> String
where
    E: StdError + 'static,
    R: Debug,
{
    DisplayErrorContext(err).to_string()
}
