//! The scoped writer: a pipe, one background worker and an error channel per
//! destination.

pub mod error;
pub mod pipe;
pub mod scoped_writer;
