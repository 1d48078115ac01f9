//! Framed secure connection.
//!
//! Each frame is an encrypted 2-byte length header followed by an
//! encrypted payload `[useful u16 LE][total u16 LE][data][padding]`, both
//! sealed by the direction's implicit-nonce [`BlockCipher`]. Writes above
//! [`MAX_WRITE_CHUNK`] are split into randomly sized frames and every frame
//! carries a random amount of padding, so on-wire sizes do not mirror the
//! caller's writes.
//!
//! The two directions sit behind independent locks: one reader and one
//! writer may proceed concurrently. Concurrent readers (or writers) are
//! serialized by the lock, which keeps the implicit nonces in step.
//!
//! Both halves are driven by poll functions that keep partial frames in
//! their own state, so [`SecureConn`] is also an `AsyncRead + AsyncWrite`
//! byte stream and its futures are cancel safe.

mod reader;
mod writer;

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use tokio::io::{split, AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::crypto::BlockCipher;
use crate::error::Result;
use crate::handshake::SessionId;

pub use reader::FrameReader;
pub use writer::FrameWriter;

/// Largest decrypted payload of one frame, including its 4-byte prefix
pub const MAX_PAYLOAD_SIZE: usize = 16384;

/// Length prefix inside each payload: useful and total lengths
pub const PAYLOAD_OVERHEAD: usize = 4;

/// Largest caller data carried by a single frame
pub const MAX_WRITE_CHUNK: usize = MAX_PAYLOAD_SIZE - PAYLOAD_OVERHEAD;

/// Lower bound for frame sizes when a write is split
pub const BASE_WRITE_CHUNK: usize = 9000;

pub(crate) const LENGTH_HEADER_SIZE: usize = 2;

/// Local close flag shared by both halves of one connection.
///
/// Closing wakes whichever half is parked on the stream so that it returns
/// `ConnectionClosed` and gives up its lock.
#[derive(Debug, Default)]
pub(crate) struct CloseSignal {
    closed: AtomicBool,
    reader: parking_lot::Mutex<Option<Waker>>,
    writer: parking_lot::Mutex<Option<Waker>>,
}

impl CloseSignal {
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for slot in [&self.reader, &self.writer] {
            if let Some(waker) = slot.lock().take() {
                waker.wake();
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn register_reader(&self, waker: &Waker) {
        register(&self.reader, waker);
    }

    pub(crate) fn register_writer(&self, waker: &Waker) {
        register(&self.writer, waker);
    }
}

fn register(slot: &parking_lot::Mutex<Option<Waker>>, waker: &Waker) {
    let mut slot = slot.lock();
    match slot.as_ref() {
        Some(current) if current.will_wake(waker) => {}
        _ => *slot = Some(waker.clone()),
    }
}

/// Authenticated, length-hiding byte stream produced by a handshake.
pub struct SecureConn<S> {
    session_id: SessionId,
    signal: Arc<CloseSignal>,
    reader: Mutex<FrameReader<ReadHalf<S>>>,
    writer: Mutex<FrameWriter<WriteHalf<S>>>,
}

impl<S> SecureConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(
        stream: S,
        session_id: SessionId,
        send_cipher: BlockCipher,
        recv_cipher: BlockCipher,
    ) -> Self {
        let (read_half, write_half) = split(stream);
        let signal = Arc::new(CloseSignal::default());
        Self {
            session_id,
            reader: Mutex::new(FrameReader::new(read_half, recv_cipher, signal.clone())),
            writer: Mutex::new(FrameWriter::new(write_half, send_cipher, signal.clone())),
            signal,
        }
    }

    /// Session id negotiated by the handshake.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Read decrypted data. See [`FrameReader::read`].
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.reader.lock().await.read(buf).await
    }

    /// Encrypt and send all of `data`. See [`FrameWriter::write`].
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.writer.lock().await.write(data).await
    }

    /// Close both directions and drop the underlying stream.
    ///
    /// A read or write parked on this connection returns `ConnectionClosed`.
    /// The peer reads whatever was already sent, then end of stream; its
    /// writes fail once the transport notices the stream is gone.
    pub async fn close(&self) -> Result<()> {
        self.signal.close();

        let mut writer = self.writer.lock().await;
        let result = writer.shutdown().await;
        writer.release();
        drop(writer);

        self.reader.lock().await.release();
        debug!("session {}: closed", self.session_id);
        result
    }

    /// Split into independently owned halves.
    pub fn into_split(self) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>) {
        (self.reader.into_inner(), self.writer.into_inner())
    }
}

impl<S> AsyncRead for SecureConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().reader.get_mut()).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for SecureConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(self.get_mut().writer.get_mut()).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().writer.get_mut()).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().writer.get_mut()).poll_shutdown(cx)
    }
}

impl<S> fmt::Debug for SecureConn<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureConn")
            .field("session_id", &self.session_id)
            .finish()
    }
}
