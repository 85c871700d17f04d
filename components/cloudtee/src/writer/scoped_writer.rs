//! Scoped Writer - responsibility and behavior
//!
//! A `ScopedWriter` wraps one destination-specific upload behind a uniform
//! "write bytes, then close" contract. It owns:
//! - the write end of a bounded [`pipe`](crate::writer::pipe), whose read end is
//!   handed to the destination worker,
//! - the `JoinHandle` of that worker, spawned exactly once at construction,
//! - a bounded error channel the worker reports failures through, and
//! - a `CancellationToken` used to stop the worker's scheduling loops.
//!
//! Design notes:
//! - `write` only waits for the pipe to accept the bytes, then polls the error
//!   channel for at most [`ERROR_POLL_WINDOW`]. A slow destination therefore
//!   slows the producer only once its pipe is full.
//! - Cancellation is cooperative. It unblocks timers and selects inside the
//!   worker; it never aborts a request that is already in flight.
//! - Errors are reported with a non-blocking send. When the channel is full the
//!   newest error is dropped, so the first failure always wins.

// Local crates
use crate::writer::{
    error::DestinationError,
    pipe::{DEFAULT_PIPE_CAPACITY, PipeReader, PipeWriter, pipe},
};

// External crates
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

/// Upper bound on how long `write` waits for an asynchronous error.
pub const ERROR_POLL_WINDOW: Duration = Duration::from_millis(5);

/// Capacity of the per-destination error channel.
pub const ERROR_CHANNEL_CAPACITY: usize = 10;

type BoxedWorker = Box<dyn FnOnce(WorkerContext) -> BoxFuture<'static, ()> + Send>;

/// Sending half of a scoped writer's error channel, held by its worker.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<DestinationError>,
    locator: Arc<str>,
}

impl ErrorReporter {
    /// Queue `err` for the next `write`/`close` call without blocking.
    pub fn report(&self, err: DestinationError) {
        match self.tx.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                tracing::warn!(
                    destination = %self.locator,
                    error = %err,
                    "Destination error channel is full, dropping newer error"
                );
            }
            Err(TrySendError::Closed(err)) => {
                tracing::debug!(
                    destination = %self.locator,
                    error = %err,
                    "Destination error channel closed, error discarded"
                );
            }
        }
    }
}

/// Everything a destination worker owns for its lifetime.
#[derive(Debug)]
pub struct WorkerContext {
    /// Read end of the destination pipe; end-of-stream means the writer closed.
    pub pipe: PipeReader,
    /// Cancelled when the writer is closed or dropped.
    pub cancel: CancellationToken,
    /// Failure channel back to the producer.
    pub errors: ErrorReporter,
    /// Human readable destination locator, for diagnostics.
    pub locator: Arc<str>,
}

/// Builder for a [`ScopedWriter`].
pub struct ScopedWriterBuilder {
    locator: String,
    pipe_capacity: usize,
    worker: Option<BoxedWorker>,
}

impl fmt::Debug for ScopedWriterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedWriterBuilder")
            .field("locator", &self.locator)
            .field("pipe_capacity", &self.pipe_capacity)
            .field("worker", &self.worker.as_ref().map(|_| "<worker>"))
            .finish()
    }
}

impl ScopedWriterBuilder {
    /// Number of chunks the pipe buffers before `write` waits.
    pub fn pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }

    /// The destination-specific upload work, run on the background task.
    pub fn worker<F, Fut>(mut self, worker: F) -> Self
    where
        F: FnOnce(WorkerContext) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.worker = Some(Box::new(move |ctx| worker(ctx).boxed()));
        self
    }

    /// Spawn the worker and return the writer.
    ///
    /// Fails with [`DestinationError::MissingWorker`] when no worker was set,
    /// or with the worker's own error if it fails immediately.
    #[instrument(
        name = "cloudtee_scoped_writer::spawn",
        target = "writer::scoped_writer",
        skip_all,
        fields(destination = %self.locator),
        level = "debug"
    )]
    pub async fn spawn(self) -> Result<ScopedWriter, DestinationError> {
        let Some(worker) = self.worker else {
            return Err(DestinationError::MissingWorker {
                locator: self.locator,
            });
        };

        let locator: Arc<str> = Arc::from(self.locator.as_str());
        let (pipe_writer, pipe_reader) = pipe(self.pipe_capacity);
        let (err_tx, err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let ctx = WorkerContext {
            pipe: pipe_reader,
            cancel: cancel.clone(),
            errors: ErrorReporter {
                tx: err_tx,
                locator: Arc::clone(&locator),
            },
            locator: Arc::clone(&locator),
        };

        tracing::debug!("Spawning destination worker task");
        let span = tracing::debug_span!("destination_worker", destination = %locator);
        let handle = tokio::spawn(worker(ctx).instrument(span));

        let mut writer = ScopedWriter {
            locator: self.locator,
            pipe: Some(pipe_writer),
            errors: err_rx,
            cancel,
            handle: Some(handle),
        };

        if let Some(err) = writer.poll_error().await {
            tracing::error!(error = %err, "Destination worker failed during start up");
            if let Err(close_err) = writer.close().await {
                tracing::debug!(error = %close_err, "Ignoring close error of failed destination");
            }
            return Err(err);
        }

        Ok(writer)
    }
}

/// A pipe, a background worker and an error channel for one destination.
#[derive(Debug)]
pub struct ScopedWriter {
    locator: String,
    pipe: Option<PipeWriter>,
    errors: mpsc::Receiver<DestinationError>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScopedWriter {
    /// Start building a writer for the destination named `locator`.
    pub fn builder(locator: impl Into<String>) -> ScopedWriterBuilder {
        ScopedWriterBuilder {
            locator: locator.into(),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            worker: None,
        }
    }

    /// Forward `buf` to the worker, then surface an already known failure.
    ///
    /// The bytes are accepted even when an error is returned; the error belongs
    /// to earlier work of the background task.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, DestinationError> {
        self.write_unpolled(buf).await?;
        match self.poll_error().await {
            Some(err) => Err(err),
            None => Ok(buf.len()),
        }
    }

    /// Forward `buf` without polling the error channel afterwards.
    pub(crate) async fn write_unpolled(&mut self, buf: &[u8]) -> Result<(), DestinationError> {
        let Some(pipe) = self.pipe.as_ref() else {
            return Err(self.pipe_closed());
        };
        if pipe.write(buf).await.is_ok() {
            return Ok(());
        }
        // The worker is gone; prefer the reason it reported over a bare pipe error.
        match self.errors.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Err(self.pipe_closed()),
        }
    }

    /// Close the pipe, cancel the worker, wait for it and report the first error.
    ///
    /// A worker that did not finish normally takes precedence over errors it
    /// reported. Closing an already closed writer is a no-op.
    #[instrument(
        name = "cloudtee_scoped_writer::close",
        target = "writer::scoped_writer",
        skip_all,
        fields(destination = %self.locator),
        level = "debug"
    )]
    pub async fn close(&mut self) -> Result<(), DestinationError> {
        let Some(handle) = self.handle.take() else {
            tracing::debug!("Scoped writer already closed");
            return Ok(());
        };

        tracing::debug!("Closing destination pipe and cancelling worker");
        drop(self.pipe.take());
        self.cancel.cancel();

        if let Err(join_err) = handle.await {
            tracing::error!(error = %join_err, "Destination worker did not finish normally");
            return Err(DestinationError::WorkerPanicked {
                locator: self.locator.clone(),
                message: join_err.to_string(),
            });
        }

        tracing::debug!("Destination worker finished");
        match self.errors.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }

    /// Stop the worker without letting it finish its upload.
    ///
    /// The task is aborted before the pipe is released, so the worker never
    /// observes end-of-input and cannot complete a partial upload.
    pub(crate) fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.cancel.cancel();
        drop(self.pipe.take());
    }

    async fn poll_error(&mut self) -> Option<DestinationError> {
        match timeout(ERROR_POLL_WINDOW, self.errors.recv()).await {
            Ok(Some(err)) => Some(err),
            Ok(None) | Err(_) => None,
        }
    }

    fn pipe_closed(&self) -> DestinationError {
        DestinationError::PipeClosed {
            locator: self.locator.clone(),
        }
    }
}

impl Drop for ScopedWriter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
