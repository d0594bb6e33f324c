use crate::codec::{self, Decoded, FrameReader};
use crate::config::ClientConfig;
use crate::error::{ClientError, FrameError};
use crate::event::{ClientEvent, ClientId, DisconnectReason, Observers};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument;

/// How a connection left the Live state.
#[derive(Debug, Clone)]
enum Closure {
    Disconnected(DisconnectReason),
    Faulted(String),
}

/// A connected stream that is not exchanging messages yet.
///
/// Subscribe first, then [`start`](PendingClient::start): events raised by
/// the I/O tasks are only delivered to observers registered at that point.
pub struct PendingClient {
    id: ClientId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: ClientConfig,
    observers: Observers<ClientEvent>,
}

impl PendingClient {
    /// Establishes an outbound connection.
    ///
    /// # Examples
    /// ```no_run
    /// # use tokio_chat_relay::{ClientConfig, PendingClient};
    /// # async fn doc_test() -> anyhow::Result<()> {
    /// let pending = PendingClient::connect("127.0.0.1:8080", ClientConfig::default()).await?;
    /// let mut events = pending.subscribe();
    /// let client = pending.start();
    /// client.send("hello".as_bytes().to_vec())?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect<A>(addr: A, config: ClientConfig) -> Result<Self>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        let connecting = TcpStream::connect(&addr);
        let stream = match config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .with_context(|| format!("connect to {addr} timed out after {limit:?}"))?,
            None => connecting.await,
        }
        .with_context(|| format!("failed to connect to {addr}"))?;
        info!("Connected to {}", addr);
        Self::from_stream(stream, config)
    }

    /// Wraps an already established stream, typically one from `accept`.
    pub fn from_stream(stream: TcpStream, config: ClientConfig) -> Result<Self> {
        let peer_addr = stream.peer_addr().context("stream has no peer address")?;
        stream.set_nodelay(config.nodelay)?;
        Ok(PendingClient {
            id: ClientId::next(),
            stream,
            peer_addr,
            config,
            observers: Observers::new(),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.observers.subscribe()
    }

    /// Spawns the receive and send tasks. Must be called within a tokio runtime.
    pub fn start(self) -> Client {
        let (read_half, write_half) = self.stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            id: self.id,
            peer_addr: self.peer_addr,
            max_frame_length: self.config.max_frame_length,
            closure: OnceLock::new(),
            open_halves: AtomicUsize::new(2),
            stop: stop_tx,
            outbound: outbound_tx,
            observers: self.observers,
            tasks: Mutex::new(None),
        });

        let span = info_span!("client", id = %shared.id, peer = %shared.peer_addr);
        let reader = FrameReader::with_max_frame_length(read_half, self.config.max_frame_length);
        let receive = tokio::spawn(
            supervise(shared.clone(), receive_loop(shared.clone(), reader, stop_rx.clone()))
                .instrument(span.clone()),
        );
        let send = tokio::spawn(
            supervise(shared.clone(), send_loop(shared.clone(), write_half, outbound_rx, stop_rx))
                .instrument(span),
        );
        *shared.lock_tasks() = Some([receive, send]);

        debug!(id = %shared.id, peer = %shared.peer_addr, "Client started");
        Client { shared }
    }
}

struct Shared {
    id: ClientId,
    peer_addr: SocketAddr,
    max_frame_length: usize,
    closure: OnceLock<Closure>,
    // Stream halves still owned by an I/O task. The last one out notifies.
    open_halves: AtomicUsize,
    stop: watch::Sender<bool>,
    outbound: mpsc::UnboundedSender<Bytes>,
    observers: Observers<ClientEvent>,
    tasks: Mutex<Option<[JoinHandle<Result<()>>; 2]>>,
}

impl Shared {
    fn is_live(&self) -> bool {
        self.closure.get().is_none()
    }

    /// Events raised by the I/O tasks after the connection closed are dropped.
    fn emit(&self, event: ClientEvent) {
        if self.is_live() {
            self.observers.emit(event);
        }
    }

    fn disconnect(&self, reason: DisconnectReason) -> bool {
        if self.closure.set(Closure::Disconnected(reason)).is_err() {
            return false;
        }
        // Both I/O tasks drop their stream half on this signal, closing the socket.
        self.stop.send_replace(true);
        info!(id = %self.id, peer = %self.peer_addr, %reason, "Client disconnected");
        true
    }

    /// Closes the connection after a fatal error. Observers see their
    /// channel end without a `Disconnected` event.
    fn fault(&self, err: &anyhow::Error) {
        if self.closure.set(Closure::Faulted(format!("{err:#}"))).is_ok() {
            self.stop.send_replace(true);
            error!(id = %self.id, peer = %self.peer_addr, "Client faulted: {:?}", err);
        }
    }

    /// Called once per I/O task after its stream half was dropped.
    fn release_half(&self) {
        if self.is_live() {
            // Only a panicking or cancelled task gets here without a closure.
            self.fault(&anyhow::anyhow!("client task ended unexpectedly"));
        }
        if self.open_halves.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let last = match self.closure.get() {
            Some(Closure::Disconnected(reason)) => Some(ClientEvent::Disconnected(*reason)),
            _ => None,
        };
        debug!(id = %self.id, "Stream released");
        self.observers.finish(last);
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Option<[JoinHandle<Result<()>>; 2]>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A live (or closed) message connection to a remote endpoint.
///
/// Cloning yields another handle to the same connection. The
/// [`ClientEvent::Disconnected`] event is raised only after both I/O tasks
/// have dropped their half of the stream, so by the time observers see it
/// the socket is closed.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Convenience for `PendingClient::connect` followed by `start`, for
    /// callers that subscribe later.
    pub async fn connect<A>(addr: A, config: ClientConfig) -> Result<Self>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        Ok(PendingClient::connect(addr, config).await?.start())
    }

    pub fn id(&self) -> ClientId {
        self.shared.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn is_live(&self) -> bool {
        self.shared.is_live()
    }

    /// The reason recorded by the disconnect that closed this client.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self.shared.closure.get() {
            Some(Closure::Disconnected(reason)) => Some(*reason),
            _ => None,
        }
    }

    /// The error that closed this client, if it was closed by a fault.
    pub fn fault_message(&self) -> Option<&str> {
        match self.shared.closure.get() {
            Some(Closure::Faulted(message)) => Some(message.as_str()),
            _ => None,
        }
    }

    /// Registers an observer for events raised from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.shared.observers.subscribe()
    }

    /// Queues a message for sending and returns immediately.
    ///
    /// Frames go out one at a time in call order; a [`ClientEvent::Sent`]
    /// follows each completed write. Failures after the message was queued
    /// are reported only through [`ClientEvent::Disconnected`].
    ///
    /// # Arguments
    /// - `message`: The payload. Must be non-empty and fit the configured
    ///   `max_frame_length`.
    ///
    /// # Returns
    /// `Ok(())` once the message is queued, or the [`ClientError`] that kept
    /// it from being queued.
    ///
    /// # Examples
    /// ```no_run
    /// # use tokio_chat_relay::{Client, ClientConfig, ClientError};
    /// # async fn doc_test() -> anyhow::Result<()> {
    /// let client = Client::connect("127.0.0.1:8080", ClientConfig::default()).await?;
    /// client.send("hello")?;
    /// assert!(matches!(client.send(""), Err(ClientError::EmptyMessage)));
    /// # Ok(())
    /// # }
    /// ```
    pub fn send(&self, message: impl Into<Bytes>) -> Result<(), ClientError> {
        let message = message.into();
        if message.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        if message.len() > self.shared.max_frame_length {
            return Err(FrameError::Oversized {
                length: message.len(),
                max: self.shared.max_frame_length,
            }
            .into());
        }
        if !self.is_live() {
            return Err(ClientError::Disconnected);
        }
        self.shared
            .outbound
            .send(message)
            .map_err(|_| ClientError::Disconnected)
    }

    /// Closes the connection. Only the first call has any effect; it returns
    /// `true`, and the single [`ClientEvent::Disconnected`] follows once the
    /// stream is released.
    pub fn disconnect(&self, reason: DisconnectReason) -> bool {
        self.shared.disconnect(reason)
    }

    /// Waits for both I/O tasks to finish and returns the fatal error that
    /// stopped them, if any. Later calls return `Ok(())` immediately.
    pub async fn join(&self) -> Result<()> {
        let tasks = self.shared.lock_tasks().take();
        let Some(tasks) = tasks else {
            return Ok(());
        };
        let mut outcome = Ok(());
        for task in tasks {
            let result = task.await.context("client task panicked")?;
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.shared.id)
            .field("peer_addr", &self.shared.peer_addr)
            .field("closure", &self.shared.closure.get())
            .finish()
    }
}

/// Drop guard for one I/O task's share of the stream.
struct HalfGuard(Arc<Shared>);

impl Drop for HalfGuard {
    fn drop(&mut self) {
        self.0.release_half();
    }
}

/// Runs an I/O loop and reports its stream half as released afterwards,
/// on every exit path including a panic.
async fn supervise(shared: Arc<Shared>, io: impl Future<Output = Result<()>>) -> Result<()> {
    let _half = HalfGuard(shared);
    // Bound after the guard so the loop, and the half it owns, drops first.
    let io = io;
    io.await
}

async fn receive_loop(
    shared: Arc<Shared>,
    mut reader: FrameReader<OwnedReadHalf>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let decoded = tokio::select! {
            biased;
            _ = stop.changed() => {
                debug!("Receive loop stopped by local disconnect");
                return Ok(());
            }
            decoded = reader.read_frame() => decoded,
        };

        match decoded {
            Ok(Decoded::Message(message)) => {
                debug!("Received {} bytes", message.len());
                shared.emit(ClientEvent::Received(message));
            }
            Ok(Decoded::Closed(reason)) => {
                shared.disconnect(reason);
                return Ok(());
            }
            Err(_) if !shared.is_live() => return Ok(()),
            Err(e) => {
                let err = anyhow::Error::new(e).context("receive loop failed");
                shared.fault(&err);
                return Err(err);
            }
        }
    }
}

async fn send_loop(
    shared: Arc<Shared>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            biased;
            _ = stop.changed() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = stop.changed() => break,
            written = codec::write_frame(&mut writer, &message) => written,
        };

        match written {
            Ok(()) => {
                debug!("Sent {} bytes", message.len());
                shared.emit(ClientEvent::Sent(message));
            }
            Err(_) if !shared.is_live() => break,
            Err(e) => match codec::remote_close_reason(&e) {
                Some(_) => {
                    warn!("Write failed, peer is gone: {}", e);
                    shared.disconnect(DisconnectReason::RemoteAbrupt);
                    break;
                }
                None => {
                    let err = anyhow::Error::new(e).context("send loop failed");
                    shared.fault(&err);
                    return Err(err);
                }
            },
        }
    }
    debug!("Send loop finished");
    Ok(())
}
