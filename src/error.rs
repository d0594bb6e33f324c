use std::io;
use thiserror::Error;

/// Errors raised by the framing codec.
///
/// Both variants are fatal for the connection that produced them: a remote
/// close is never reported through this type, see [`crate::codec::Decoded`].
#[derive(Error, Debug)]
pub enum FrameError {
    /// The length prefix announced more bytes than the reader accepts.
    #[error("frame of {length} bytes exceeds the {max} byte limit")]
    Oversized { length: usize, max: usize },

    /// I/O failure that is not one of the recognized remote-close conditions.
    #[error("frame I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Errors returned synchronously by [`crate::client::Client::send`].
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection is closed")]
    Disconnected,

    /// A zero-length frame is what the remote side reads as a close.
    #[error("empty messages cannot be sent")]
    EmptyMessage,

    #[error(transparent)]
    Frame(#[from] FrameError),
}
