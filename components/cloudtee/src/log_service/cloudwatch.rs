//! AWS CloudWatch Logs implementation of [`LogService`].

// Local crates
use crate::log_service::{LogEvent, LogService, LogServiceError, LogStreamInfo, SequenceToken};

// External crates
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_cloudwatchlogs::{
    Client,
    error::DisplayErrorContext,
    operation::put_log_events::PutLogEventsError,
    types::InputLogEvent,
};
use tracing::instrument;

/// [`LogService`] backed by AWS CloudWatch Logs.
#[derive(Debug, Clone)]
pub struct CloudWatchLogService {
    client: Client,
}

impl CloudWatchLogService {
    /// Build a client from the default credential chain for `region`.
    pub async fn from_env(region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region.filter(|r| !r.is_empty()) {
            loader = loader.region(Region::new(region.to_string()));
        }
        let sdk_config = loader.load().await;
        Self::new(Client::new(&sdk_config))
    }

    /// Wrap an existing SDK client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn service_error<E>(operation: &'static str, err: E) -> LogServiceError
where
    E: std::error::Error,
{
    LogServiceError::Service {
        operation,
        message: DisplayErrorContext(err).to_string(),
    }
}

#[async_trait]
impl LogService for CloudWatchLogService {
    #[instrument(
        name = "cloudtee_cloudwatch::describe_log_streams",
        target = "log_service::cloudwatch",
        skip(self),
        level = "debug"
    )]
    async fn describe_log_streams(
        &self,
        group: &str,
        prefix: &str,
    ) -> Result<Vec<LogStreamInfo>, LogServiceError> {
        let mut streams = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .client
                .describe_log_streams()
                .log_group_name(group)
                .log_stream_name_prefix(prefix)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|err| {
                    let err = err.into_service_error();
                    if err.is_resource_not_found_exception() {
                        LogServiceError::LogGroupNotFound {
                            group: group.to_string(),
                            message: DisplayErrorContext(err).to_string(),
                        }
                    } else {
                        service_error("DescribeLogStreams", err)
                    }
                })?;

            streams.extend(output.log_streams().iter().filter_map(|stream| {
                stream.log_stream_name().map(|name| LogStreamInfo {
                    name: name.to_string(),
                    upload_sequence_token: stream.upload_sequence_token().map(SequenceToken::from),
                })
            }));

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        tracing::debug!(count = streams.len(), "Described log streams");
        Ok(streams)
    }

    #[instrument(
        name = "cloudtee_cloudwatch::create_log_group",
        target = "log_service::cloudwatch",
        skip(self, tags),
        level = "debug"
    )]
    async fn create_log_group(
        &self,
        group: &str,
        tags: &[(&str, &str)],
    ) -> Result<(), LogServiceError> {
        let mut request = self.client.create_log_group().log_group_name(group);
        for (key, value) in tags {
            request = request.tags(*key, *value);
        }
        request.send().await.map_err(|err| {
            let err = err.into_service_error();
            if err.is_resource_already_exists_exception() {
                LogServiceError::ResourceAlreadyExists {
                    message: DisplayErrorContext(err).to_string(),
                }
            } else {
                service_error("CreateLogGroup", err)
            }
        })?;
        Ok(())
    }

    #[instrument(
        name = "cloudtee_cloudwatch::create_log_stream",
        target = "log_service::cloudwatch",
        skip(self),
        level = "debug"
    )]
    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), LogServiceError> {
        self.client
            .create_log_stream()
            .log_group_name(group)
            .log_stream_name(stream)
            .send()
            .await
            .map_err(|err| {
                let err = err.into_service_error();
                if err.is_resource_already_exists_exception() {
                    LogServiceError::ResourceAlreadyExists {
                        message: DisplayErrorContext(err).to_string(),
                    }
                } else if err.is_resource_not_found_exception() {
                    LogServiceError::LogGroupNotFound {
                        group: group.to_string(),
                        message: DisplayErrorContext(err).to_string(),
                    }
                } else {
                    service_error("CreateLogStream", err)
                }
            })?;
        Ok(())
    }

    #[instrument(
        name = "cloudtee_cloudwatch::put_log_events",
        target = "log_service::cloudwatch",
        skip(self, events, token),
        fields(events = events.len()),
        level = "debug"
    )]
    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        events: &[LogEvent],
        token: Option<&SequenceToken>,
    ) -> Result<Option<SequenceToken>, LogServiceError> {
        let input = events
            .iter()
            .map(|event| {
                InputLogEvent::builder()
                    .message(event.message.as_str())
                    .timestamp(event.timestamp)
                    .build()
                    .map_err(|err| service_error("PutLogEvents", err))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .client
            .put_log_events()
            .log_group_name(group)
            .log_stream_name(stream)
            .set_log_events(Some(input))
            .set_sequence_token(token.map(|t| t.as_str().to_string()))
            .send()
            .await
            .map_err(|err| match err.into_service_error() {
                PutLogEventsError::InvalidSequenceTokenException(inner) => {
                    LogServiceError::InvalidSequenceToken {
                        expected: inner.expected_sequence_token().map(SequenceToken::from),
                        message: DisplayErrorContext(&inner).to_string(),
                    }
                }
                PutLogEventsError::ResourceNotFoundException(inner) => {
                    LogServiceError::LogGroupNotFound {
                        group: group.to_string(),
                        message: DisplayErrorContext(&inner).to_string(),
                    }
                }
                other => service_error("PutLogEvents", other),
            })?;

        if let Some(rejected) = output.rejected_log_events_info() {
            tracing::warn!(rejected = ?rejected, "Some log events were rejected");
        }

        Ok(output.next_sequence_token().map(SequenceToken::from))
    }
}
