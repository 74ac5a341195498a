use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::AsyncWrite;

/// Decodes base64 text written into it and forwards the bytes to `inner`.
///
/// Writes may split the text anywhere; an incomplete trailing quantum is
/// held until the next write completes it. ASCII whitespace (including the
/// CRLF PowerShell appends) is ignored.
pub struct Base64Pipe<W> {
    inner: W,
    /// Undecoded text, always shorter than one quantum between writes.
    carry: Vec<u8>,
    pending: Vec<u8>,
    written: usize,
}

impl<W> Base64Pipe<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            carry: Vec::new(),
            pending: Vec::new(),
            written: 0,
        }
    }

    /// Fails if the text written so far stopped partway through a quantum.
    pub fn finish(&self) -> io::Result<()> {
        if self.carry.is_empty() {
            return Ok(());
        }
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("truncated base64 input: {} trailing characters", self.carry.len()),
        ))
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> Base64Pipe<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for Base64Pipe<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        this.carry
            .extend(buf.iter().copied().filter(|b| !b.is_ascii_whitespace()));
        let whole = this.carry.len() - this.carry.len() % 4;
        if whole > 0 {
            let decoded = STANDARD.decode(&this.carry[..whole]);
            this.carry.drain(..whole);
            this.pending = decoded.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        this.finish()?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_decodes_each_write() {
        let mut pipe = Base64Pipe::new(Vec::new());
        pipe.write_all(b"aGVsbG8g\r\n").await.unwrap();
        pipe.write_all(b"d29y bGQ=").await.unwrap();
        pipe.flush().await.unwrap();
        assert_eq!(pipe.into_inner(), b"hello world");
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        let mut pipe = Base64Pipe::new(Vec::new());
        let err = pipe.write_all(b"not-base64!!").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_reassembles_split_quanta() {
        let mut pipe = Base64Pipe::new(Vec::new());
        pipe.write_all(b"aGVsbG").await.unwrap();
        pipe.write_all(b"8\r\ngd29y").await.unwrap();
        pipe.write_all(b"bGQ=\r\n").await.unwrap();
        pipe.flush().await.unwrap();
        pipe.finish().unwrap();
        assert_eq!(pipe.into_inner(), b"hello world");
    }

    #[tokio::test]
    async fn test_truncated_input_fails_on_finish() {
        let mut pipe = Base64Pipe::new(Vec::new());
        pipe.write_all(b"aGk=aG").await.unwrap();
        pipe.flush().await.unwrap();
        assert_eq!(pipe.finish().unwrap_err().kind(), io::ErrorKind::InvalidData);

        let err = pipe.shutdown().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(pipe.into_inner(), b"hi");
    }
}
