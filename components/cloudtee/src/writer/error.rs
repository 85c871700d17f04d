//! Destination error handling
//!
//! Every failure a destination can produce is a [`DestinationError`]. Errors
//! raised on a background worker never cross the task boundary on their own:
//! they travel through the scoped writer's error channel and are returned by
//! the next `write` or `close` call of that destination.

// Local crates
use crate::log_service::LogServiceError;

// External crates
use thiserror::Error;

/// Coarse classification of a [`DestinationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The destination could not be prepared; nothing was written.
    Construction,
    /// A background worker failed while moving data.
    Transfer,
    /// The destination could not be shut down cleanly.
    Close,
    /// The log service rejected an append because of a stale sequence token.
    Protocol,
}

/// Errors raised by a single destination.
#[derive(Debug, Error)]
pub enum DestinationError {
    /// The target object exists and overwriting it is not allowed.
    #[error("{locator} already exists, overwrite is not allowed")]
    ObjectExists { locator: String },

    /// Checking whether the target object exists failed.
    #[error("failed to check whether {locator} exists: {source}")]
    ObjectProbe {
        locator: String,
        #[source]
        source: object_store::Error,
    },

    /// Writing the initial empty object failed.
    #[error("failed to put empty object at {locator}: {source}")]
    ObjectPrepare {
        locator: String,
        #[source]
        source: object_store::Error,
    },

    /// Streaming the payload to the object store failed.
    #[error("upload to {locator} failed: {source}")]
    Upload {
        locator: String,
        #[source]
        source: std::io::Error,
    },

    /// Resolving or creating the log group/stream failed.
    #[error("cloudwatch logs destination initialize ({locator}): {source}")]
    LogSetup {
        locator: String,
        #[source]
        source: LogServiceError,
    },

    /// Appending a batch of events failed.
    #[error("put log events to {locator} failed: {source}")]
    LogAppend {
        locator: String,
        #[source]
        source: LogServiceError,
    },

    /// Splitting the stream into lines failed.
    #[error("reading lines for {locator} failed: {source}")]
    Scan {
        locator: String,
        #[source]
        source: std::io::Error,
    },

    /// The destination worker has stopped reading its pipe.
    #[error("pipe to {locator} is closed")]
    PipeClosed { locator: String },

    /// A scoped writer was spawned without a worker.
    #[error("no worker configured for {locator}")]
    MissingWorker { locator: String },

    /// The destination worker did not finish normally.
    #[error("worker for {locator} terminated abnormally: {message}")]
    WorkerPanicked { locator: String, message: String },
}

impl DestinationError {
    /// Classify the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ObjectExists { .. }
            | Self::ObjectProbe { .. }
            | Self::ObjectPrepare { .. }
            | Self::LogSetup { .. }
            | Self::MissingWorker { .. } => ErrorClass::Construction,
            Self::LogAppend { source, .. } if source.is_invalid_sequence_token() => {
                ErrorClass::Protocol
            }
            Self::Upload { .. }
            | Self::LogAppend { .. }
            | Self::Scan { .. }
            | Self::PipeClosed { .. } => ErrorClass::Transfer,
            Self::WorkerPanicked { .. } => ErrorClass::Close,
        }
    }

    /// True when the destination can no longer accept bytes.
    pub fn is_pipe_closed(&self) -> bool {
        matches!(self, Self::PipeClosed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_token_is_a_protocol_error() {
        let err = DestinationError::LogAppend {
            locator: "LogGroup=/g, LogStream=s".to_string(),
            source: LogServiceError::InvalidSequenceToken {
                expected: Some("token-2".into()),
                message: "bad token".to_string(),
            },
        };
        assert_eq!(err.class(), ErrorClass::Protocol);

        let err = DestinationError::LogAppend {
            locator: "LogGroup=/g, LogStream=s".to_string(),
            source: LogServiceError::Service {
                operation: "PutLogEvents",
                message: "throttled".to_string(),
            },
        };
        assert_eq!(err.class(), ErrorClass::Transfer);
    }

    #[test]
    fn conflict_message_names_the_locator() {
        let err = DestinationError::ObjectExists {
            locator: "s3://bucket/key.log".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "s3://bucket/key.log already exists, overwrite is not allowed"
        );
        assert_eq!(err.class(), ErrorClass::Construction);
    }
}
