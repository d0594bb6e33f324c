use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Why a connection ended. Carried on disconnect events for observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The application called `disconnect` on this side.
    LocalRequest,
    /// The peer closed its send side (zero-length read).
    RemoteGraceful,
    /// The transport reported a reset or abort while the connection was live.
    RemoteAbrupt,
    /// The owning server is shutting down.
    ServerShutdown,
}

impl DisconnectReason {
    pub fn is_remote(self) -> bool {
        matches!(self, Self::RemoteGraceful | Self::RemoteAbrupt)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::LocalRequest => "local disconnect requested",
            Self::RemoteGraceful => "remote host disconnected gracefully",
            Self::RemoteAbrupt => "remote host disconnected ungracefully",
            Self::ServerShutdown => "server shutdown",
        };
        f.write_str(text)
    }
}

/// Process-unique identifier of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ClientId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Notifications raised by a single client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A complete frame was decoded from the stream.
    Received(Bytes),
    /// A frame carrying this message was written and flushed.
    Sent(Bytes),
    /// The connection is closed. Always the last event on the channel.
    Disconnected(DisconnectReason),
}

/// Notifications raised by a [`crate::server::ChatServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected { id: ClientId, addr: SocketAddr },
    ClientDisconnected { id: ClientId, reason: DisconnectReason },
    /// The client's I/O failed with a fatal error and it was dropped.
    ClientFaulted { id: ClientId, error: String },
    /// The listener stopped accepting after an unrecoverable error. Tracked
    /// clients stay connected until `shutdown`.
    ListenerFailed { error: String },
    /// Shutdown finished. Always the last event on the channel.
    Shutdown,
}

/// Fan-out list of event subscribers.
///
/// The owning component is the only producer. Once closed, every receiver
/// drains what was already sent and then yields `None`, and later subscribers
/// get a receiver that is already finished.
pub(crate) struct Observers<E> {
    senders: Mutex<Option<Vec<mpsc::UnboundedSender<E>>>>,
}

impl<E: Clone> Observers<E> {
    pub(crate) fn new() -> Self {
        Observers {
            senders: Mutex::new(Some(Vec::new())),
        }
    }

    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(senders) = self.lock().as_mut() {
            senders.push(tx);
        }
        rx
    }

    pub(crate) fn emit(&self, event: E) {
        if let Some(senders) = self.lock().as_mut() {
            Self::fan_out(senders, event);
        }
    }

    /// Emits a final event and closes the list under the same lock, so no
    /// other event can slip in after it.
    pub(crate) fn finish(&self, last: Option<E>) {
        let mut guard = self.lock();
        if let (Some(senders), Some(event)) = (guard.as_mut(), last) {
            Self::fan_out(senders, event);
        }
        *guard = None;
    }

    fn fan_out(senders: &mut Vec<mpsc::UnboundedSender<E>>, event: E) {
        // Receivers that were dropped are pruned here.
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Vec<mpsc::UnboundedSender<E>>>> {
        // A panic while holding this lock cannot leave the list half-updated.
        self.senders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
