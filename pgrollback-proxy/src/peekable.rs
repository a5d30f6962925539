use std::{
    cmp, io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Wrapper to make a stream "peekable".
/// Eg we can look ahead at the incoming data without consuming it for future reads.
pub struct Peekable<S> {
    pub(crate) inner: S,
    peeked: Vec<u8>,
}

impl<S> Peekable<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            peeked: vec![],
        }
    }

    /// Returns the underlying stream
    pub fn inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> Peekable<S> {
    /// Peeks ahead of the current read position.
    /// This will read exactly the requested number of bytes
    /// or fail if the underlying stream ends prematurely.
    pub async fn peek(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let cur_peeked = self.peeked.len();
        if cur_peeked < buf.len() {
            self.peeked.resize(buf.len(), 0);

            if let Err(err) = self.inner.read_exact(&mut self.peeked[cur_peeked..]).await {
                // Keep whatever we did manage to buffer for future reads
                self.peeked.truncate(cur_peeked);
                return Err(err);
            }
        }

        buf.copy_from_slice(&self.peeked[..buf.len()]);
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Peekable<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.peeked.is_empty() {
            let len = cmp::min(buf.remaining(), this.peeked.len());
            buf.put_slice(&this.peeked[..len]);
            this.peeked.drain(..len);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Peekable<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl From<Vec<u8>> for Peekable<io::Cursor<Vec<u8>>> {
    fn from(data: Vec<u8>) -> Self {
        Peekable::new(io::Cursor::new(data))
    }
}
