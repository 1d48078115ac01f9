//! Receiving half of a framed connection.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, trace};

use crate::conn::{CloseSignal, LENGTH_HEADER_SIZE, MAX_PAYLOAD_SIZE, PAYLOAD_OVERHEAD};
use crate::crypto::{BlockCipher, TAG_SIZE};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    Payload,
}

/// Decrypts frames from the underlying stream and hands back their data.
///
/// Data beyond what the caller's buffer holds is kept for the next read.
/// A frame that has only partly arrived is buffered here as well, so a
/// read future may be dropped at any point without losing stream position.
pub struct FrameReader<R> {
    inner: Option<R>,
    cipher: BlockCipher,
    signal: Arc<CloseSignal>,
    pending: BytesMut,
    partial: Vec<u8>,
    filled: usize,
    stage: Stage,
    eof: bool,
    broken: bool,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub(crate) fn new(inner: R, cipher: BlockCipher, signal: Arc<CloseSignal>) -> Self {
        let header_len = header_len(&cipher);
        Self {
            inner: Some(inner),
            cipher,
            signal,
            pending: BytesMut::new(),
            partial: vec![0u8; header_len],
            filled: 0,
            stage: Stage::Header,
            eof: false,
            broken: false,
        }
    }

    /// Read decrypted data into `buf`, returning how many bytes were copied.
    ///
    /// Blocks until at least one byte is available. Cancel safe.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` once either side closed the connection,
    /// `DecryptFailed` on a forged or corrupted frame. After any error the
    /// reader stays unusable: the implicit nonce can no longer be trusted.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        poll_fn(|cx| self.poll_read_data(cx, buf)).await
    }

    pub(crate) fn poll_read_data(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        self.signal.register_reader(cx.waker());
        if self.signal.is_closed() {
            return Poll::Ready(Err(Error::ConnectionClosed));
        }
        if !self.pending.is_empty() {
            return Poll::Ready(Ok(self.drain_pending(buf)));
        }
        if self.broken {
            return Poll::Ready(Err(Error::ConnectionClosed));
        }

        loop {
            let data = match ready!(self.poll_frame(cx)) {
                Ok(data) => data,
                Err(e) => {
                    self.broken = true;
                    return Poll::Ready(Err(e));
                }
            };
            if data.is_empty() {
                continue;
            }
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            self.pending.extend_from_slice(&data[n..]);
            return Poll::Ready(Ok(n));
        }
    }

    /// Drop the underlying stream half.
    pub(crate) fn release(&mut self) {
        self.inner = None;
        self.broken = true;
    }

    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        n
    }

    fn begin(&mut self, stage: Stage, len: usize) {
        self.stage = stage;
        self.partial.clear();
        self.partial.resize(len, 0);
        self.filled = 0;
    }

    /// Fill `partial` from the stream.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let inner = self.inner.as_mut().ok_or(Error::ConnectionClosed)?;
        while self.filled < self.partial.len() {
            let mut buf = ReadBuf::new(&mut self.partial[self.filled..]);
            ready!(Pin::new(&mut *inner).poll_read(cx, &mut buf)).map_err(Error::from_io)?;
            let n = buf.filled().len();
            if n == 0 {
                self.eof = self.stage == Stage::Header && self.filled == 0;
                return Poll::Ready(Err(Error::ConnectionClosed));
            }
            self.filled += n;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_frame(&mut self, cx: &mut Context<'_>) -> Poll<Result<Vec<u8>>> {
        loop {
            ready!(self.poll_fill(cx))?;
            match self.stage {
                Stage::Header => {
                    let length = self.cipher.decrypt(&self.partial)?;
                    let length = u16::from_le_bytes([length[0], length[1]]) as usize;
                    let accepted = PAYLOAD_OVERHEAD + TAG_SIZE..=MAX_PAYLOAD_SIZE + TAG_SIZE;
                    if !accepted.contains(&length) {
                        debug!("frame length {} out of range", length);
                        return Poll::Ready(Err(Error::ProtocolViolation));
                    }
                    self.begin(Stage::Payload, length);
                }
                Stage::Payload => {
                    let mut payload = self.cipher.decrypt(&self.partial)?;
                    let on_wire = self.partial.len();
                    self.begin(Stage::Header, header_len(&self.cipher));

                    let useful = u16::from_le_bytes([payload[0], payload[1]]) as usize;
                    let total = u16::from_le_bytes([payload[2], payload[3]]) as usize;
                    if useful > total || total + PAYLOAD_OVERHEAD != payload.len() {
                        debug!(
                            "frame lengths inconsistent: useful {} total {} payload {}",
                            useful,
                            total,
                            payload.len()
                        );
                        return Poll::Ready(Err(Error::ProtocolViolation));
                    }
                    trace!("read frame: {} data bytes, {} sealed", useful, on_wire);

                    payload.truncate(PAYLOAD_OVERHEAD + useful);
                    payload.drain(..PAYLOAD_OVERHEAD);
                    return Poll::Ready(Ok(payload));
                }
            }
        }
    }
}

/// Sealed length header size; the first one also carries the nonce.
fn header_len(cipher: &BlockCipher) -> usize {
    cipher.nonce_overhead() + LENGTH_HEADER_SIZE + TAG_SIZE
}

impl<R> AsyncRead for FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// A peer close between frames reads as end of stream; a close inside a
    /// frame or any other failure is an error.
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(this.poll_read_data(cx, buf.initialize_unfilled())) {
            Ok(n) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Err(Error::ConnectionClosed) if this.eof => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(e.into())),
        }
    }
}

impl<R> std::fmt::Debug for FrameReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("pending", &self.pending.len())
            .field("stage", &self.stage)
            .field("broken", &self.broken)
            .finish()
    }
}
