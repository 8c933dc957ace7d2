//! Implementation of the AWS Batch scheduler.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_batch::Client;
use aws_sdk_batch::types::AssignPublicIp;
use aws_sdk_batch::types::ContainerProperties;
use aws_sdk_batch::types::EfsAuthorizationConfig;
use aws_sdk_batch::types::EfsTransitEncryption;
use aws_sdk_batch::types::EfsVolumeConfiguration;
use aws_sdk_batch::types::FargatePlatformConfiguration;
use aws_sdk_batch::types::JobDefinitionType;
use aws_sdk_batch::types::JobTimeout;
use aws_sdk_batch::types::KeyValuePair;
use aws_sdk_batch::types::KeyValuesPair;
use aws_sdk_batch::types::MountPoint as BatchMountPoint;
use aws_sdk_batch::types::NetworkConfiguration;
use aws_sdk_batch::types::PlatformCapability;
use aws_sdk_batch::types::ResourceRequirement;
use aws_sdk_batch::types::ResourceType;
use aws_sdk_batch::types::Volume;
use tracing::debug;
use tracing::warn;

use super::BatchScheduler;
use super::SchedulerError;
use crate::aws::classify;
use crate::aws::display;
use crate::job::CANCEL_REASON;
use crate::job::JobDescription;
use crate::job::JobSpec;
use crate::job::JobState;

/// The Fargate platform version that supports EFS volumes.
const FARGATE_PLATFORM_VERSION: &str = "1.4.0";

/// The queue tag naming the role for workflow jobs.
const WORKFLOW_ROLE_TAG: &str = "WorkflowEngineRoleArn";

/// A [`BatchScheduler`] backed by AWS Batch.
///
/// Every submission registers a transient job definition, submits the job
/// against it and deregisters the definition again.
#[derive(Debug, Clone)]
pub struct AwsBatchScheduler {
    /// The AWS Batch client.
    client: Client,
}

impl AwsBatchScheduler {
    /// Constructs a new scheduler from the given SDK configuration.
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }

    /// Reads the workflow role ARN from the `WorkflowEngineRoleArn` tag of a
    /// job queue.
    ///
    /// Infrastructure provisioning can set this tag so users don't need to
    /// supply the role when submitting workflows.
    pub async fn workflow_role(&self, queue: &str) -> Result<Option<String>, SchedulerError> {
        let response = self
            .client
            .describe_job_queues()
            .job_queues(queue)
            .send()
            .await
            .map_err(classify)?;

        Ok(response
            .job_queues()
            .first()
            .and_then(|q| q.tags())
            .and_then(|tags| tags.get(WORKFLOW_ROLE_TAG))
            .filter(|arn| arn.starts_with("arn:aws:iam::"))
            .cloned())
    }

    /// Builds the container properties of a job definition.
    fn container_properties(spec: &JobSpec) -> Result<ContainerProperties, SchedulerError> {
        let resources = spec.resources();
        let requirement = |ty: ResourceType, value: String| {
            ResourceRequirement::builder()
                .r#type(ty)
                .value(value)
                .build()
                .map_err(|e| SchedulerError::Rejected(e.to_string()))
        };

        let mut volumes = Vec::with_capacity(spec.mounts().len());
        let mut mount_points = Vec::with_capacity(spec.mounts().len());
        for (i, mount) in spec.mounts().iter().enumerate() {
            let name = format!("efs{i}");
            let mut efs = EfsVolumeConfiguration::builder()
                .file_system_id(&mount.filesystem)
                .transit_encryption(EfsTransitEncryption::Enabled);
            if let Some(access_point) = &mount.access_point {
                efs = efs.authorization_config(
                    EfsAuthorizationConfig::builder()
                        .access_point_id(access_point)
                        .build(),
                );
            }

            volumes.push(
                Volume::builder()
                    .name(&name)
                    .efs_volume_configuration(
                        efs.build()
                            .map_err(|e| SchedulerError::Rejected(e.to_string()))?,
                    )
                    .build(),
            );
            mount_points.push(
                BatchMountPoint::builder()
                    .source_volume(name)
                    .container_path(mount.container_path.to_string_lossy())
                    .build(),
            );
        }

        let environment = spec
            .environment()
            .iter()
            .map(|(k, v)| KeyValuePair::builder().name(k).value(v).build())
            .collect::<Vec<_>>();

        let mut properties = ContainerProperties::builder()
            .image(spec.image())
            .set_command(Some(spec.command().to_vec()))
            .resource_requirements(requirement(
                ResourceType::Vcpu,
                format_vcpus(resources.vcpus),
            )?)
            .resource_requirements(requirement(
                ResourceType::Memory,
                resources.memory_mib.to_string(),
            )?)
            .set_volumes(Some(volumes))
            .set_mount_points(Some(mount_points))
            .set_environment(Some(environment));

        if let Some(fargate) = spec.fargate() {
            properties = properties
                .execution_role_arn(&fargate.role_arn)
                .job_role_arn(&fargate.role_arn)
                .fargate_platform_configuration(
                    FargatePlatformConfiguration::builder()
                        .platform_version(FARGATE_PLATFORM_VERSION)
                        .build(),
                );
            if fargate.assign_public_ip {
                properties = properties.network_configuration(
                    NetworkConfiguration::builder()
                        .assign_public_ip(AssignPublicIp::Enabled)
                        .build(),
                );
            }
        }

        Ok(properties.build())
    }

    /// Deregisters a transient job definition.
    ///
    /// Failure is not fatal: unused definitions expire on their own.
    async fn deregister(&self, definition: &str) {
        match self
            .client
            .deregister_job_definition()
            .job_definition(definition)
            .send()
            .await
        {
            Ok(_) => debug!(definition, "deregistered job definition"),
            Err(e) => warn!(
                definition,
                error = display(&e),
                "failed to deregister job definition"
            ),
        }
    }
}

/// Formats a vCPU count the way AWS Batch expects it (`"2"`, `"0.5"`).
fn format_vcpus(vcpus: f64) -> String {
    if vcpus.fract() == 0.0 {
        format!("{}", vcpus as u64)
    } else {
        format!("{vcpus}")
    }
}

#[async_trait]
impl BatchScheduler for AwsBatchScheduler {
    async fn submit(&self, spec: &JobSpec) -> Result<String, SchedulerError> {
        let mut register = self
            .client
            .register_job_definition()
            .job_definition_name(spec.name())
            .r#type(JobDefinitionType::Container)
            .container_properties(Self::container_properties(spec)?);
        if spec.fargate().is_some() {
            register = register.platform_capabilities(PlatformCapability::Fargate);
        }

        let definition = register.send().await.map_err(classify)?;
        let definition = definition.job_definition_arn().to_string();
        debug!(%definition, "registered job definition");

        let mut submit = self
            .client
            .submit_job()
            .job_name(spec.name())
            .job_queue(spec.queue())
            .job_definition(&definition)
            .set_tags(Some(
                spec.tags()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>(),
            ));
        if let Some(timeout) = spec.timeout() {
            submit = submit.timeout(
                JobTimeout::builder()
                    .attempt_duration_seconds(timeout.as_secs().try_into().unwrap_or(i32::MAX))
                    .build(),
            );
        }

        let result = submit.send().await;
        self.deregister(&definition).await;
        Ok(result.map_err(classify)?.job_id().to_string())
    }

    async fn find(&self, queue: &str, name: &str) -> Result<Option<String>, SchedulerError> {
        find_in_pages(name, |next_token| async move {
            let response = self
                .client
                .list_jobs()
                .job_queue(queue)
                .filters(KeyValuesPair::builder().name("JOB_NAME").values(name).build())
                .set_next_token(next_token)
                .send()
                .await
                .map_err(classify)?;

            let jobs = response
                .job_summary_list()
                .iter()
                .map(|s| (s.job_name().to_string(), s.job_id().to_string()))
                .collect();
            Ok((jobs, response.next_token().map(str::to_string)))
        })
        .await
    }

    async fn describe(&self, ids: &[String]) -> Result<Vec<JobDescription>, SchedulerError> {
        let response = self
            .client
            .describe_jobs()
            .set_jobs(Some(ids.to_vec()))
            .send()
            .await
            .map_err(classify)?;

        Ok(response
            .jobs()
            .iter()
            .filter_map(|job| {
                let state = match job.status().as_str().parse::<JobState>() {
                    Ok(state) => state,
                    Err(e) => {
                        warn!(job_id = job.job_id(), "{e}");
                        return None;
                    }
                };

                let container = job.container();
                let status_reason = job.status_reason().map(str::to_string);
                let state = if state == JobState::Failed
                    && status_reason.as_deref() == Some(CANCEL_REASON)
                {
                    JobState::Cancelled
                } else {
                    state
                };

                Some(JobDescription {
                    id: job.job_id().to_string(),
                    state,
                    exit_code: container.and_then(|c| c.exit_code()),
                    reason: container.and_then(|c| c.reason()).map(str::to_string),
                    status_reason,
                    log_stream: container
                        .and_then(|c| c.log_stream_name())
                        .map(str::to_string),
                })
            })
            .collect())
    }

    async fn terminate(&self, id: &str, reason: &str) -> Result<(), SchedulerError> {
        self.client
            .terminate_job()
            .job_id(id)
            .reason(reason)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}

/// A page of `(name, id)` job summaries and the token of the next page.
type JobPage = (Vec<(String, String)>, Option<String>);

/// Reads pages of job summaries until a job with the given name is found or
/// the pages run out.
async fn find_in_pages<F, Fut>(name: &str, mut page: F) -> Result<Option<String>, SchedulerError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<JobPage, SchedulerError>>,
{
    let mut next_token = None;
    loop {
        let (jobs, token) = page(next_token).await?;
        if let Some((_, id)) = jobs.into_iter().find(|(n, _)| n == name) {
            return Ok(Some(id));
        }

        match token {
            Some(token) => next_token = Some(token),
            None => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;

    fn page(jobs: &[(&str, &str)], next: Option<&str>) -> JobPage {
        (
            jobs.iter()
                .map(|(n, id)| (n.to_string(), id.to_string()))
                .collect(),
            next.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn find_follows_next_token() {
        let requested = Mutex::new(Vec::new());
        let found = find_in_pages("hello-abc", |token| {
            requested.lock().unwrap().push(token.clone());
            async move {
                Ok(match token.as_deref() {
                    None => page(&[("other", "job-1")], Some("p2")),
                    Some("p2") => page(&[], Some("p3")),
                    _ => page(&[("hello-abc", "job-9")], None),
                })
            }
        })
        .await
        .unwrap();

        assert_eq!(found.as_deref(), Some("job-9"));
        assert_eq!(
            *requested.lock().unwrap(),
            [None, Some("p2".to_string()), Some("p3".to_string())]
        );

        let missing = find_in_pages("hello-abc", |_| async { Ok(page(&[("other", "job-1")], None)) })
            .await
            .unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn vcpus_format() {
        assert_eq!(format_vcpus(2.0), "2");
        assert_eq!(format_vcpus(0.5), "0.5");
    }
}
