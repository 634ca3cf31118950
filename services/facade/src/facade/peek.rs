//! Replayable connection wrapper.
//!
//! A [`PeekableConn`] owns one stream and retains every byte read from it
//! while the request head is being inspected. Readers of the wrapper see
//! the retained bytes first, then the live stream, so the byte sequence
//! observed through the wrapper is exactly the sequence the client sent.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Size of a single read into the retention buffer.
pub const DEFAULT_FILL_CHUNK: usize = 4096;

/// A stream wrapper that can be peeked without losing bytes.
#[derive(Debug)]
pub struct PeekableConn<S> {
    inner: S,
    /// Bytes read from `inner` but not yet delivered through `poll_read`.
    buffer: Vec<u8>,
    /// Cursor into `buffer`; everything before it has been delivered.
    pos: usize,
}

impl<S> PeekableConn<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            pos: 0,
        }
    }

    /// Retained bytes that the next read will return before touching the stream.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[self.pos..]
    }

    /// Mark `n` retained bytes as delivered.
    ///
    /// `n` is clamped to the number of retained bytes.
    pub fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.buffer.len());
        if self.pos == self.buffer.len() {
            self.buffer.clear();
            self.pos = 0;
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap the stream, returning it with any retained bytes it no longer holds.
    pub fn into_parts(mut self) -> (S, Vec<u8>) {
        let rest = self.buffer.split_off(self.pos);
        (self.inner, rest)
    }
}

impl<S: AsyncRead + Unpin> PeekableConn<S> {
    /// Read more bytes from the stream into the retention buffer.
    ///
    /// The cursor does not move, so the bytes stay available to later
    /// readers. Returns the number of new bytes, `0` at end of stream.
    pub async fn fill(&mut self, max: usize) -> io::Result<usize> {
        let start = self.buffer.len();
        self.buffer.resize(start + max.max(1), 0);
        let result = self.inner.read(&mut self.buffer[start..]).await;
        let n = *result.as_ref().unwrap_or(&0);
        self.buffer.truncate(start + n);
        result
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let retained = self.buffered();
        if !retained.is_empty() {
            let n = retained.len().min(buf.remaining());
            buf.put_slice(&retained[..n]);
            self.consume(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
