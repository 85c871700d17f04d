//! Token-sequenced, append-only log API used by the log destination.
//!
//! [`LogService`] is the seam between the batching writer and the remote
//! service. `cloudwatch` talks to AWS CloudWatch Logs, `memory` keeps
//! everything in-process for tests and dry runs.

pub mod cloudwatch;
pub mod memory;

// External crates
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Fixed per-event overhead the service adds to the message size.
pub const EVENT_OVERHEAD_BYTES: usize = 26;

/// Maximum size of one event, overhead included.
pub const MAX_EVENT_BYTES: usize = 262_144;

/// Longest message that fits in one event.
pub const MAX_EVENT_MESSAGE_BYTES: usize = MAX_EVENT_BYTES - EVENT_OVERHEAD_BYTES;

/// One log record: a message and its wall-clock timestamp in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Line content without its line ending.
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl LogEvent {
    /// Event with an explicit timestamp in milliseconds.
    pub fn new(message: impl Into<String>, timestamp: i64) -> Self {
        Self {
            message: message.into(),
            timestamp,
        }
    }

    /// Stamp `message` with the current time.
    pub fn now(message: impl Into<String>) -> Self {
        Self::new(message, chrono::Utc::now().timestamp_millis())
    }

    /// Size the service accounts for this event in a batch.
    pub fn encoded_size(&self) -> usize {
        self.message.len() + EVENT_OVERHEAD_BYTES
    }
}

/// Opaque ordering cursor returned by an append.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceToken(String);

impl SequenceToken {
    /// Wrap a token string returned by the service.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SequenceToken {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for SequenceToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// A stream as reported by a describe call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStreamInfo {
    /// Stream name.
    pub name: String,
    /// Token the next append must present; `None` for an empty stream.
    pub upload_sequence_token: Option<SequenceToken>,
}

/// Failures reported by a [`LogService`].
#[derive(Debug, Error)]
pub enum LogServiceError {
    /// The log group does not exist.
    #[error("log group {group} does not exist: {message}")]
    LogGroupNotFound {
        /// Group that was looked up.
        group: String,
        /// Service message.
        message: String,
    },

    /// The append presented a stale or wrong token.
    #[error("invalid sequence token: {message}")]
    InvalidSequenceToken {
        /// Token the service expected, when it said.
        expected: Option<SequenceToken>,
        /// Service message.
        message: String,
    },

    /// The group or stream to create exists already.
    #[error("resource already exists: {message}")]
    ResourceAlreadyExists {
        /// Service message.
        message: String,
    },

    /// Any other failure of `operation`.
    #[error("{operation} failed: {message}")]
    Service {
        /// API operation name.
        operation: &'static str,
        /// Error description.
        message: String,
    },
}

impl LogServiceError {
    /// True for a token rejection.
    pub fn is_invalid_sequence_token(&self) -> bool {
        matches!(self, Self::InvalidSequenceToken { .. })
    }

    /// True when the group is missing.
    pub fn is_log_group_not_found(&self) -> bool {
        matches!(self, Self::LogGroupNotFound { .. })
    }

    /// Token the service expected, when it told us.
    pub fn expected_token(&self) -> Option<&SequenceToken> {
        match self {
            Self::InvalidSequenceToken { expected, .. } => expected.as_ref(),
            _ => None,
        }
    }
}

/// Operations the log destination needs from the remote service.
#[async_trait]
pub trait LogService: Send + Sync + fmt::Debug {
    /// Streams of `group` whose name starts with `prefix`.
    async fn describe_log_streams(
        &self,
        group: &str,
        prefix: &str,
    ) -> Result<Vec<LogStreamInfo>, LogServiceError>;

    async fn create_log_group(
        &self,
        group: &str,
        tags: &[(&str, &str)],
    ) -> Result<(), LogServiceError>;

    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), LogServiceError>;

    /// Append `events` in order. `token` is `None` only for a stream that has
    /// never been written to. Returns the token for the next append.
    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        events: &[LogEvent],
        token: Option<&SequenceToken>,
    ) -> Result<Option<SequenceToken>, LogServiceError>;
}
