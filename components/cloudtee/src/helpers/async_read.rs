use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf, Result as IoResult};

/// Abstracts "why reading stops" into a future. Once the future completes the
/// reader reports end-of-stream, whatever the underlying source still holds.
///
/// The tee uses it to turn an interrupt into a clean end of input.
pub trait ReadUntilExt: AsyncRead {
    fn read_until_future<F>(self, until: F) -> ReadUntil<Self, F>
    where
        Self: Sized,
        F: Future<Output = ()>,
    {
        ReadUntil {
            reader: self,
            until,
            stopped: false,
        }
    }
}

impl<S> ReadUntilExt for S where S: AsyncRead {}

/// Reader returned by [`ReadUntilExt::read_until_future`].
#[pin_project]
#[derive(Debug)]
pub struct ReadUntil<S, F> {
    #[pin]
    reader: S,
    #[pin]
    until: F,
    stopped: bool,
}

impl<S, F> ReadUntil<S, F> {
    /// True once the stop future has completed.
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl<S, F> AsyncRead for ReadUntil<S, F>
where
    S: AsyncRead,
    F: Future<Output = ()>,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<IoResult<()>> {
        let this = self.project();
        if *this.stopped {
            return Poll::Ready(Ok(()));
        }

        // A completed future must not be polled again.
        match this.until.poll(cx) {
            Poll::Ready(()) => {
                *this.stopped = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => this.reader.poll_read(cx, buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn source_is_read_until_stop_fires() {
        let source: &[u8] = b"all of it";
        let mut reader = source.read_until_future(std::future::pending());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"all of it");
    }

    #[tokio::test]
    async fn completed_stop_future_reads_as_eof() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"before").await.unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let mut reader = rx.read_until_future(Box::pin(async move {
            let _ = stop_rx.await;
        }));

        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"before");

        stop_tx.send(()).unwrap();
        tx.write_all(b"after").await.unwrap();
        let n = tokio::time::timeout(Duration::from_secs(1), reader.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(reader.is_stopped());
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }
}
