//! Length-prefixed framing on top of a byte stream.
//!
//! Every message travels as `[u32 length, little-endian][payload]`. Reads are
//! strictly two-phase: exactly four bytes of prefix, then exactly `length`
//! payload bytes. Nothing is buffered across frames.
//!
//! A zero length prefix, or the stream ending anywhere inside a frame, means
//! the peer closed its send side. A legitimately empty message therefore
//! cannot be told apart from a close, which is why
//! [`Client::send`](crate::client::Client::send) refuses empty payloads.

use crate::error::FrameError;
use crate::event::DisconnectReason;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Width of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default upper bound on an incoming payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Outcome of reading one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Message(Bytes),
    /// The remote side went away; no more frames will follow.
    Closed(DisconnectReason),
}

/// Encodes `message` as one frame.
pub fn encode_frame(message: &[u8]) -> Result<Bytes, FrameError> {
    let length = u32::try_from(message.len()).map_err(|_| FrameError::Oversized {
        length: message.len(),
        max: u32::MAX as usize,
    })?;
    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_LEN + message.len());
    frame.put_u32_le(length);
    frame.put_slice(message);
    Ok(frame.freeze())
}

/// Writes one frame and flushes it.
///
/// Errors are returned as raw I/O errors so the caller can tell a torn-down
/// peer apart from a real fault with [`remote_close_reason`].
pub async fn write_frame<W>(writer: &mut W, message: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Maps an I/O error to the remote-close condition it stands for, if any.
pub fn remote_close_reason(err: &io::Error) -> Option<DisconnectReason> {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => Some(DisconnectReason::RemoteGraceful),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::TimedOut => Some(DisconnectReason::RemoteAbrupt),
        _ => None,
    }
}

/// Reads frames from the read side of a stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    max_frame_length: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame_length(inner, DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(inner: R, max_frame_length: usize) -> Self {
        FrameReader {
            inner,
            max_frame_length,
        }
    }

    /// Reads exactly one frame, suspending until it is complete or the
    /// stream ends.
    ///
    /// Not cancel safe: dropping the future mid-frame loses the bytes already
    /// consumed. The client only cancels it when tearing the stream down.
    pub async fn read_frame(&mut self) -> Result<Decoded, FrameError> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        if let Err(e) = self.inner.read_exact(&mut prefix).await {
            return closed_or_fault(e);
        }

        let length = u32::from_le_bytes(prefix) as usize;
        if length == 0 {
            return Ok(Decoded::Closed(DisconnectReason::RemoteGraceful));
        }
        if length > self.max_frame_length {
            return Err(FrameError::Oversized {
                length,
                max: self.max_frame_length,
            });
        }

        let mut payload = BytesMut::zeroed(length);
        if let Err(e) = self.inner.read_exact(&mut payload).await {
            return closed_or_fault(e);
        }
        Ok(Decoded::Message(payload.freeze()))
    }
}

fn closed_or_fault(err: io::Error) -> Result<Decoded, FrameError> {
    match remote_close_reason(&err) {
        Some(reason) => Ok(Decoded::Closed(reason)),
        None => Err(err.into()),
    }
}
