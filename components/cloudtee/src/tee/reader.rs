//! Duplicating Reader - responsibility and behavior
//!
//! Wraps the input source. Every chunk handed to the caller has first been
//! forwarded to every live destination, so no destination ever lags behind
//! what the caller has seen.
//!
//! Failure policy:
//! - A destination `write` error is logged and remembered, the read itself
//!   still succeeds. A destination whose worker is gone (pipe closed) is
//!   detached and gets no further bytes.
//! - `close` closes every destination concurrently, even after failures, and
//!   reports the first close error in destination order, else the first
//!   remembered write error.
//! - After `close`, reads return end-of-stream without touching the source.

// Local crates
use crate::destination::{Destination, Sink};
use crate::writer::error::DestinationError;

// External crates
use futures::future::join_all;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

/// Size of the chunks `copy_to` reads from the source.
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug)]
struct Tap<S> {
    sink: S,
    detached: bool,
    first_error: Option<DestinationError>,
}

impl<S: Sink> Tap<S> {
    async fn forward(&mut self, chunk: &[u8]) {
        let Err(err) = self.sink.write(chunk).await else {
            return;
        };
        tracing::error!(destination = %self.sink, error = %err, "Destination write failed");
        if err.is_pipe_closed() {
            tracing::warn!(destination = %self.sink, "Detaching destination, its worker has stopped");
            self.detached = true;
        }
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }
}

/// Source reader that forwards every chunk it returns to its destinations.
#[derive(Debug)]
pub struct DuplicatingReader<R, S = Destination> {
    source: R,
    taps: Vec<Tap<S>>,
    closed: bool,
}

impl<R, S> DuplicatingReader<R, S>
where
    R: AsyncRead + Unpin,
    S: Sink,
{
    /// Feed `sinks`, in order, from `source`.
    pub fn new(source: R, sinks: Vec<S>) -> Self {
        Self {
            source,
            taps: sinks
                .into_iter()
                .map(|sink| Tap {
                    sink,
                    detached: false,
                    first_error: None,
                })
                .collect(),
            closed: false,
        }
    }

    /// Locators of the destinations, in order.
    pub fn destinations(&self) -> Vec<String> {
        self.taps.iter().map(|tap| tap.sink.describe()).collect()
    }

    /// True once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read from the source into `buf`, forwarding the bytes to every
    /// destination before returning. Returns `Ok(0)` once closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        let n = self.source.read(buf).await?;
        if n > 0 {
            let chunk = &buf[..n];
            join_all(
                self.taps
                    .iter_mut()
                    .filter(|tap| !tap.detached)
                    .map(|tap| tap.forward(chunk)),
            )
            .await;
        }
        Ok(n)
    }

    /// Pump the source into `out` until end-of-stream, flushing every chunk.
    #[instrument(
        name = "cloudtee_duplicating_reader::copy_to",
        target = "tee::reader",
        skip_all,
        level = "debug"
    )]
    pub async fn copy_to<W>(&mut self, out: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                tracing::debug!(bytes = total, "Source reached end of stream");
                return Ok(total);
            }
            out.write_all(&buf[..n]).await?;
            out.flush().await?;
            total += n as u64;
        }
    }

    /// Close every destination and report the first failure.
    #[instrument(
        name = "cloudtee_duplicating_reader::close",
        target = "tee::reader",
        skip_all,
        level = "debug"
    )]
    pub async fn close(&mut self) -> Result<(), DestinationError> {
        if self.closed {
            tracing::debug!("Duplicating reader already closed");
            return Ok(());
        }
        self.closed = true;

        let results = join_all(self.taps.iter_mut().map(|tap| async move {
            let result = tap.sink.close().await;
            match &result {
                Ok(()) => tracing::debug!(destination = %tap.sink, "Destination closed"),
                Err(err) => {
                    tracing::error!(destination = %tap.sink, error = %err, "Destination close failed")
                }
            }
            result
        }))
        .await;

        let mut first_close_error = None;
        for result in results {
            if let Err(err) = result {
                first_close_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_close_error {
            return Err(err);
        }
        match self.taps.iter_mut().find_map(|tap| tap.first_error.take()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
