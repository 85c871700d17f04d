//! Destinations a stream can be duplicated to.
//!
//! The set of destination kinds is fixed, so it is modelled as the closed
//! [`Destination`] enum. Everything that consumes destinations (the
//! duplicating reader in particular) only relies on the [`Sink`] capability.

pub mod log_batch;
pub mod log_writer;
pub mod object_writer;

// Local crates
use crate::destination::{log_writer::LogWriter, object_writer::ObjectWriter};
use crate::writer::error::DestinationError;

// External crates
use async_trait::async_trait;
use std::fmt;

/// Something bytes can be written to and that is closed exactly once.
#[async_trait]
pub trait Sink: Send + fmt::Display {
    /// Forward `buf`; returns the number of bytes accepted.
    async fn write(&mut self, buf: &[u8]) -> Result<usize, DestinationError>;

    /// Flush, finish and release the sink. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), DestinationError>;

    /// Human readable locator, for operator-facing logs.
    fn describe(&self) -> String {
        self.to_string()
    }
}

/// Object store target, displayed as `s3://bucket/key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectDestination {
    /// Bucket name.
    pub bucket: String,
    /// Object key, without a leading `/`.
    pub key: String,
}

impl fmt::Display for ObjectDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Log service target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogDestination {
    /// Log group name.
    pub group: String,
    /// Log stream name derived from the output name.
    pub stream: String,
}

impl fmt::Display for LogDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogGroup={}, LogStream={}", self.group, self.stream)
    }
}

/// A prepared destination with its running writer.
#[derive(Debug)]
pub enum Destination {
    /// Upload to an object store.
    Object(ObjectWriter),
    /// Append to a log stream.
    Log(LogWriter),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(writer) => writer.fmt(f),
            Self::Log(writer) => writer.fmt(f),
        }
    }
}

impl Destination {
    /// Stop the writer without finishing its upload. Used to roll back a
    /// partially prepared destination set.
    pub(crate) fn abort(&mut self) {
        match self {
            Self::Object(writer) => writer.abort(),
            Self::Log(writer) => writer.abort(),
        }
    }
}

#[async_trait]
impl Sink for Destination {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, DestinationError> {
        match self {
            Self::Object(writer) => writer.write(buf).await,
            Self::Log(writer) => writer.write(buf).await,
        }
    }

    async fn close(&mut self) -> Result<(), DestinationError> {
        match self {
            Self::Object(writer) => writer.close().await,
            Self::Log(writer) => writer.close().await,
        }
    }
}

impl From<ObjectWriter> for Destination {
    fn from(writer: ObjectWriter) -> Self {
        Self::Object(writer)
    }
}

impl From<LogWriter> for Destination {
    fn from(writer: LogWriter) -> Self {
        Self::Log(writer)
    }
}
