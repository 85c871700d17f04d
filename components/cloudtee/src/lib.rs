//! cloudtee duplicates one input byte stream to standard output and, at the
//! same time, to durable AWS destinations: an S3 object and a CloudWatch Logs
//! stream.
//!
//! Every destination runs its upload on its own background task, fed through a
//! bounded pipe by [`tee::reader::DuplicatingReader`]. Closing the reader drains
//! and closes every destination and reports the first failure.

pub mod cli;
pub mod destination;
pub mod helpers;
pub mod instrumentation;
pub mod log_service;
pub mod runtime;
pub mod tee;
pub mod writer;
