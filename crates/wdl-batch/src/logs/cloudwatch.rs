//! Implementation of a log source backed by CloudWatch Logs.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_cloudwatchlogs::Client;

use super::LogError;
use super::LogEvent;
use super::LogSource;
use crate::aws::display;

/// Reads log streams from CloudWatch Logs.
#[derive(Debug, Clone)]
pub struct CloudWatchLogs {
    /// The CloudWatch Logs client.
    client: Client,
}

impl CloudWatchLogs {
    /// Constructs a new log source from the given SDK configuration.
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }
}

#[async_trait]
impl LogSource for CloudWatchLogs {
    async fn fetch(
        &self,
        group: &str,
        stream: &str,
        start_time: Option<i64>,
    ) -> Result<Vec<LogEvent>, LogError> {
        let mut events = Vec::new();
        let mut next_token = None;
        loop {
            let response = match self
                .client
                .filter_log_events()
                .log_group_name(group)
                .log_stream_names(stream)
                .set_start_time(start_time)
                .set_next_token(next_token.take())
                .send()
                .await
            {
                Ok(response) => response,
                // The stream is created when the job first writes to it
                Err(e)
                    if e.as_service_error()
                        .is_some_and(|e| e.is_resource_not_found_exception()) =>
                {
                    return Ok(events);
                }
                Err(e) => {
                    return Err(LogError {
                        stream: stream.to_string(),
                        message: display(&e),
                    });
                }
            };

            events.extend(response.events().iter().filter_map(|e| {
                Some(LogEvent {
                    id: e.event_id()?.to_string(),
                    timestamp: e.timestamp()?,
                    message: e.message()?.to_string(),
                })
            }));

            match response.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}
