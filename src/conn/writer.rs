//! Sending half of a framed connection.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{BufMut, BytesMut};
use tokio::io::AsyncWrite;
use tracing::trace;

use crate::conn::{
    CloseSignal, BASE_WRITE_CHUNK, MAX_PAYLOAD_SIZE, MAX_WRITE_CHUNK, PAYLOAD_OVERHEAD,
};
use crate::crypto::random::random_padding;
use crate::crypto::{BlockCipher, SecureRandom, TAG_SIZE};
use crate::error::{Error, Result};

/// Base of the per-connection padding bound
const BASE_MAX_PADDING: usize = 256;

/// Encrypts caller data into padded frames.
///
/// At most one sealed frame is buffered while it drains into the stream.
pub struct FrameWriter<W> {
    inner: Option<W>,
    cipher: BlockCipher,
    signal: Arc<CloseSignal>,
    max_padding: usize,
    frame: Vec<u8>,
    written: usize,
    closed: bool,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(inner: W, cipher: BlockCipher, signal: Arc<CloseSignal>) -> Self {
        Self {
            inner: Some(inner),
            cipher,
            signal,
            max_padding: BASE_MAX_PADDING + SecureRandom::intn(BASE_MAX_PADDING),
            frame: Vec::new(),
            written: 0,
            closed: false,
        }
    }

    /// Write all of `data`, split into randomly sized frames.
    ///
    /// Returns `data.len()` only if every frame was written and flushed. On
    /// error the writer is closed; part of `data` may already be on the wire.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut rest = data;
        while !rest.is_empty() {
            let n = poll_fn(|cx| self.poll_write_data(cx, rest)).await?;
            rest = &rest[n..];
        }
        poll_fn(|cx| self.poll_flush_frames(cx)).await?;
        Ok(data.len())
    }

    /// Shut down the write side of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        poll_fn(|cx| self.poll_close(cx)).await
    }

    /// Seal the next chunk of `data` into a frame, returning its length.
    pub(crate) fn poll_write_data(
        &mut self,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<Result<usize>> {
        let result = self.poll_write_chunk(cx, data);
        if let Poll::Ready(Err(_)) = result {
            self.closed = true;
        }
        result
    }

    /// Push the buffered frame and flush the stream.
    pub(crate) fn poll_flush_frames(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let result = self.poll_flush_inner(cx);
        if let Poll::Ready(Err(_)) = result {
            self.closed = true;
        }
        result
    }

    /// Shut the stream down. A frame interrupted by a local close is
    /// discarded instead of drained.
    pub(crate) fn poll_close(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if self.signal.is_closed() {
            self.frame.clear();
            self.written = 0;
        } else if !self.closed {
            if let Err(e) = ready!(self.poll_drain(cx)) {
                self.closed = true;
                return Poll::Ready(Err(e));
            }
        }
        self.closed = true;
        match self.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_shutdown(cx).map_err(Error::from_io),
            None => Poll::Ready(Ok(())),
        }
    }

    /// Drop the underlying stream half.
    pub(crate) fn release(&mut self) {
        self.inner = None;
        self.closed = true;
    }

    fn check_open(&self, cx: &Context<'_>) -> Result<()> {
        self.signal.register_writer(cx.waker());
        if self.closed || self.signal.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    fn poll_write_chunk(&mut self, cx: &mut Context<'_>, data: &[u8]) -> Poll<Result<usize>> {
        self.check_open(cx)?;
        ready!(self.poll_drain(cx))?;
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let size = if data.len() > MAX_WRITE_CHUNK {
            SecureRandom::int_range(BASE_WRITE_CHUNK, MAX_WRITE_CHUNK)
        } else {
            data.len()
        };
        self.seal(&data[..size])?;

        // The frame now owns the bytes; a pending stream is finished later.
        if let Poll::Ready(Err(e)) = self.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(size))
    }

    fn poll_flush_inner(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.check_open(cx)?;
        ready!(self.poll_drain(cx))?;
        let inner = self.inner.as_mut().ok_or(Error::ConnectionClosed)?;
        Pin::new(inner).poll_flush(cx).map_err(Error::from_io)
    }

    /// Write out whatever is left of the buffered frame.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if self.written == self.frame.len() {
            return Poll::Ready(Ok(()));
        }
        let inner = self.inner.as_mut().ok_or(Error::ConnectionClosed)?;
        while self.written < self.frame.len() {
            let n = ready!(Pin::new(&mut *inner).poll_write(cx, &self.frame[self.written..]))
                .map_err(Error::from_io)?;
            if n == 0 {
                return Poll::Ready(Err(Error::ConnectionClosed));
            }
            self.written += n;
        }
        self.frame.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }

    fn seal(&mut self, chunk: &[u8]) -> Result<()> {
        let room = MAX_PAYLOAD_SIZE - PAYLOAD_OVERHEAD - chunk.len();
        let padding = SecureRandom::intn(self.max_padding).min(room);
        let total = chunk.len() + padding;

        let mut payload = BytesMut::with_capacity(PAYLOAD_OVERHEAD + total);
        payload.put_u16_le(chunk.len() as u16);
        payload.put_u16_le(total as u16);
        payload.put_slice(chunk);
        payload.put_slice(&random_padding(padding));

        // The length header goes first: the peer decrypts in this order.
        let sealed_len = (payload.len() + TAG_SIZE) as u16;
        let header = self.cipher.encrypt(&sealed_len.to_le_bytes())?;
        let sealed = self.cipher.encrypt(&payload)?;

        self.frame.clear();
        self.frame.extend_from_slice(&header);
        self.frame.extend_from_slice(&sealed);
        self.written = 0;

        trace!("sealed frame: {} data bytes, {} on wire", chunk.len(), self.frame.len());
        Ok(())
    }
}

impl<W> AsyncWrite for FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().poll_write_data(cx, buf).map_err(io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_flush_frames(cx).map_err(io::Error::from)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_close(cx).map_err(io::Error::from)
    }
}

impl<W> std::fmt::Debug for FrameWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("max_padding", &self.max_padding)
            .field("buffered", &(self.frame.len() - self.written))
            .field("closed", &self.closed)
            .finish()
    }
}
