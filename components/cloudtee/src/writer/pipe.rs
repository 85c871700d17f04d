//! Bounded in-memory byte pipe between the producer and a single destination
//! worker.
//!
//! The write end hands owned chunks to a bounded `mpsc` channel, the read end
//! exposes them as a regular `AsyncRead`/`AsyncBufRead`. Memory held by a pipe
//! is bounded by `capacity` chunks; a producer that outpaces its worker waits
//! in [`PipeWriter::write`].

// External crates
use bytes::Bytes;
use std::io;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

/// Number of chunks a pipe buffers before the producer has to wait.
pub const DEFAULT_PIPE_CAPACITY: usize = 64;

/// Read end of a pipe, owned by the destination worker.
pub type PipeReader = StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>;

/// Returned when the read end has been dropped, i.e. the worker is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("pipe read end has been dropped")]
pub struct PipeClosed;

/// Write end of a pipe. Dropping it signals end-of-input to the reader.
#[derive(Debug)]
pub struct PipeWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl PipeWriter {
    /// Copy `buf` into the pipe, waiting while the pipe is full.
    pub async fn write(&self, buf: &[u8]) -> Result<(), PipeClosed> {
        if buf.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Ok(Bytes::copy_from_slice(buf)))
            .await
            .map_err(|_| PipeClosed)
    }

    /// True once the read end has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a pipe buffering at most `capacity` chunks (minimum one).
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PipeWriter { tx },
        StreamReader::new(ReceiverStream::new(rx)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn reader_sees_writes_in_order_then_eof() {
        let (writer, mut reader) = pipe(4);
        writer.write(b"hello ").await.unwrap();
        writer.write(b"").await.unwrap();
        writer.write(b"world").await.unwrap();
        drop(writer);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn write_fails_once_reader_is_dropped() {
        let (writer, reader) = pipe(1);
        drop(reader);
        assert!(writer.is_closed());
        assert_eq!(writer.write(b"x").await, Err(PipeClosed));
    }
}
