use crate::client::{Client, PendingClient};
use crate::config::{RelayMode, ServerConfig};
use crate::event::{ClientEvent, ClientId, DisconnectReason, Observers, ServerEvent};
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument;

/// Builds the client wrapper for each accepted socket.
///
/// Implemented for any `Fn(TcpStream, SocketAddr) -> Result<PendingClient>`.
/// Returning an error rejects the connection; the accept loop keeps running.
pub trait ClientFactory: Send + Sync + 'static {
    fn build(&self, stream: TcpStream, addr: SocketAddr) -> Result<PendingClient>;
}

impl<F> ClientFactory for F
where
    F: Fn(TcpStream, SocketAddr) -> Result<PendingClient> + Send + Sync + 'static,
{
    fn build(&self, stream: TcpStream, addr: SocketAddr) -> Result<PendingClient> {
        self(stream, addr)
    }
}

enum State {
    Idle,
    Running(JoinHandle<Result<()>>),
    Stopped,
}

/// Chat server that accepts connections, tracks them and relays messages
/// among them.
///
/// Every accepted socket becomes a [`Client`] through the configured
/// [`ClientFactory`]. A message received from one client is forwarded to all
/// the others, or broadcast to everyone with [`RelayMode::Broadcast`].
#[derive(Clone)]
pub struct ChatServer {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    factory: Box<dyn ClientFactory>,
    clients: Mutex<HashMap<ClientId, Client>>,
    state: Mutex<State>,
    // Bound address while the accept loop runs.
    listening: Mutex<Option<SocketAddr>>,
    stop: watch::Sender<bool>,
    // Never polled itself; clones of it see a stop sent before they were made.
    stop_rx: watch::Receiver<bool>,
    observers: Observers<ServerEvent>,
}

impl ChatServer {
    /// Creates a server that wraps accepted sockets with `config.client`.
    pub fn new(config: ServerConfig) -> Self {
        let client_config = config.client.clone();
        Self::with_factory(config, move |stream: TcpStream, _addr: SocketAddr| {
            PendingClient::from_stream(stream, client_config.clone())
        })
    }

    pub fn with_factory(config: ServerConfig, factory: impl ClientFactory) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        ChatServer {
            inner: Arc::new(Inner {
                config,
                factory: Box::new(factory),
                clients: Mutex::new(HashMap::new()),
                state: Mutex::new(State::Idle),
                listening: Mutex::new(None),
                stop,
                stop_rx,
                observers: Observers::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ServerEvent> {
        self.inner.observers.subscribe()
    }

    /// Listens on every local interface at `port`.
    ///
    /// # Arguments
    /// - `port`: The port to bind. `0` picks a free one.
    ///
    /// # Returns
    /// The bound address, or an error if binding fails or the server was
    /// already started or shut down.
    ///
    /// # Examples
    /// ```no_run
    /// # use tokio_chat_relay::{ChatServer, ServerConfig};
    /// # async fn doc_test() -> anyhow::Result<()> {
    /// let server = ChatServer::new(ServerConfig::default());
    /// let mut events = server.subscribe();
    /// let addr = server.start(8080).await?;
    /// println!("listening on {addr}");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        self.start_on(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await
    }

    /// Binds `addr` and spawns the accept loop. Returns the bound address,
    /// which differs from `addr` when binding port 0.
    pub async fn start_on<A>(&self, addr: A) -> Result<SocketAddr>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        self.ensure_idle()?;
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;

        let mut state = self.inner.lock_state();
        if !matches!(*state, State::Idle) {
            bail!("chat server was started or shut down while binding");
        }
        *self.inner.lock_listening() = Some(local_addr);
        let span = info_span!("server", addr = %local_addr);
        let stop = self.inner.stop_rx.clone();
        let task = tokio::spawn(listen(self.inner.clone(), listener, stop).instrument(span));
        *state = State::Running(task);
        info!("Chat server bound to {}", local_addr);
        Ok(local_addr)
    }

    fn ensure_idle(&self) -> Result<()> {
        match *self.inner.lock_state() {
            State::Idle => Ok(()),
            State::Running(_) => bail!("chat server is already running"),
            State::Stopped => bail!("chat server has been shut down"),
        }
    }

    /// The bound address, while the listener is accepting.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.lock_listening()
    }

    pub fn is_listening(&self) -> bool {
        self.local_addr().is_some()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock_clients().len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.inner.lock_clients().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn client(&self, id: ClientId) -> Option<Client> {
        self.inner.lock_clients().get(&id).cloned()
    }

    /// Sends `message` to every tracked client except `from`.
    ///
    /// # Arguments
    /// - `from`: The originating client, which is skipped.
    /// - `message`: The payload, queued on each target with [`Client::send`].
    ///
    /// # Returns
    /// How many clients the message was queued for. Closed clients are skipped.
    ///
    /// # Examples
    /// ```no_run
    /// # use tokio_chat_relay::{ChatServer, ServerConfig, ServerEvent};
    /// # async fn doc_test() -> anyhow::Result<()> {
    /// let server = ChatServer::new(ServerConfig::default());
    /// let mut events = server.subscribe();
    /// server.start(8080).await?;
    /// if let Some(ServerEvent::ClientConnected { id, .. }) = events.recv().await {
    ///     server.forward(id, "a newcomer joined");
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn forward(&self, from: ClientId, message: impl Into<Bytes>) -> usize {
        self.inner.relay(Some(from), &message.into())
    }

    /// Sends `message` to every tracked client.
    pub fn broadcast(&self, message: impl Into<Bytes>) -> usize {
        self.inner.relay(None, &message.into())
    }

    /// Stops accepting, disconnects every client with
    /// [`DisconnectReason::ServerShutdown`] and raises [`ServerEvent::Shutdown`].
    ///
    /// Idempotent: later calls, and calls on a server that never started,
    /// only do what is left to do.
    ///
    /// # Returns
    /// The error that ended the accept loop early, if any.
    ///
    /// # Examples
    /// ```no_run
    /// # use tokio_chat_relay::{ChatServer, ServerConfig};
    /// # async fn doc_test() -> anyhow::Result<()> {
    /// let server = ChatServer::new(ServerConfig::default());
    /// server.start(8080).await?;
    /// tokio::signal::ctrl_c().await?;
    /// server.shutdown().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn shutdown(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.inner.lock_state(), State::Stopped);
        let accept_task = match previous {
            State::Stopped => return Ok(()),
            State::Idle => None,
            State::Running(task) => Some(task),
        };

        info!("Shutting down chat server");
        self.inner.stop.send_replace(true);
        let accepted = match accept_task {
            Some(task) => task.await.context("accept loop panicked").and_then(|r| r),
            None => Ok(()),
        };

        // Snapshot: each disconnect below also races to remove itself.
        let snapshot: Vec<Client> = self.inner.lock_clients().values().cloned().collect();
        for client in &snapshot {
            client.disconnect(DisconnectReason::ServerShutdown);
            match client.fault_message() {
                Some(error) => self.inner.release_faulted(client.id(), error.to_string()),
                None => {
                    let reason =
                        client.disconnect_reason().unwrap_or(DisconnectReason::ServerShutdown);
                    self.inner.release(client.id(), reason);
                }
            }
        }

        {
            let mut clients = self.inner.lock_clients();
            clients.clear();
            self.inner.observers.finish(Some(ServerEvent::Shutdown));
        }
        info!("Chat server shut down, {} clients disconnected", snapshot.len());
        accepted
    }
}

impl Inner {
    fn admit(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let pending = self.factory.build(stream, addr)?;
        let id = pending.id();
        let events = pending.subscribe();
        let client = pending.start();

        self.lock_clients().insert(id, client.clone());
        self.observers.emit(ServerEvent::ClientConnected { id, addr });

        let span = info_span!("relay", id = %id, peer = %addr);
        tokio::spawn(relay_events(self.clone(), client, events).instrument(span));
        Ok(())
    }

    fn relay(&self, except: Option<ClientId>, message: &Bytes) -> usize {
        let targets: Vec<Client> = self
            .lock_clients()
            .values()
            .filter(|client| Some(client.id()) != except && client.is_live())
            .cloned()
            .collect();

        targets
            .iter()
            .filter(|client| match client.send(message.clone()) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Skipping client {}: {}", client.id(), e);
                    false
                }
            })
            .count()
    }

    /// Removes a client and notifies observers, at most once per client.
    fn release(&self, id: ClientId, reason: DisconnectReason) {
        let mut clients = self.lock_clients();
        if clients.remove(&id).is_some() {
            info!("Client {} removed: {}", id, reason);
            self.observers.emit(ServerEvent::ClientDisconnected { id, reason });
        }
    }

    fn release_faulted(&self, id: ClientId, error: String) {
        let mut clients = self.lock_clients();
        if clients.remove(&id).is_some() {
            self.observers.emit(ServerEvent::ClientFaulted { id, error });
        }
    }

    /// Marks the listener closed once the accept loop has returned.
    fn listener_stopped(&self, outcome: &Result<()>) {
        *self.lock_listening() = None;
        if let Err(e) = outcome {
            self.observers.emit(ServerEvent::ListenerFailed {
                error: format!("{e:#}"),
            });
        }
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashMap<ClientId, Client>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_listening(&self) -> MutexGuard<'_, Option<SocketAddr>> {
        self.listening.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Longest pause between two failed accepts.
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(5);

/// What the accept loop does after a failed `accept`.
#[derive(Debug, PartialEq, Eq)]
enum AcceptAction {
    /// Only the incoming connection failed; accept the next one.
    Skip,
    /// Pause, then accept again.
    Retry(Duration),
    /// Give up on the listener.
    Fail,
}

/// Exponential backoff over consecutive listener-level accept failures,
/// such as running out of file descriptors.
struct AcceptBackoff {
    initial: Duration,
    max_retries: u32,
    failures: u32,
}

impl AcceptBackoff {
    fn new(config: &ServerConfig) -> Self {
        AcceptBackoff {
            initial: config.accept_backoff(),
            max_retries: config.max_accept_retries,
            failures: 0,
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
    }

    fn on_error(&mut self, err: &io::Error) -> AcceptAction {
        if is_per_connection_error(err) {
            return AcceptAction::Skip;
        }
        if self.failures >= self.max_retries {
            return AcceptAction::Fail;
        }
        let delay = self.initial.saturating_mul(1 << self.failures.min(16));
        self.failures += 1;
        AcceptAction::Retry(delay.min(MAX_ACCEPT_BACKOFF))
    }
}

async fn listen(
    inner: Arc<Inner>,
    listener: TcpListener,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    let outcome = accept_loop(inner.clone(), listener, stop).await;
    inner.listener_stopped(&outcome);
    outcome
}

async fn accept_loop(
    inner: Arc<Inner>,
    listener: TcpListener,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let mut backoff = AcceptBackoff::new(&inner.config);
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.changed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                backoff.reset();
                info!("Accepted connection from {}", addr);
                if let Err(e) = inner.admit(stream, addr) {
                    warn!("Rejected connection from {}: {:?}", addr, e);
                }
            }
            Err(e) => match backoff.on_error(&e) {
                AcceptAction::Skip => warn!("Accept failed for one connection: {}", e),
                AcceptAction::Retry(delay) => {
                    warn!("Accept failed, retrying in {:?}: {}", delay, e);
                    tokio::select! {
                        biased;
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                AcceptAction::Fail => {
                    error!("Accept loop failed: {:?}", e);
                    return Err(e).context("accept loop failed");
                }
            },
        }
    }
    info!("Listener stopped");
    Ok(())
}

/// Errors that concern the connection being accepted, not the listener.
fn is_per_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

async fn relay_events(
    inner: Arc<Inner>,
    client: Client,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Received(message) => {
                let delivered = match inner.config.relay {
                    RelayMode::Forward => inner.relay(Some(client.id()), &message),
                    RelayMode::Broadcast => inner.relay(None, &message),
                };
                debug!("Relayed {} bytes to {} clients", message.len(), delivered);
            }
            ClientEvent::Sent(_) => {}
            ClientEvent::Disconnected(reason) => inner.release(client.id(), reason),
        }
    }

    // The channel also ends without `Disconnected` when the client faulted.
    if let Err(e) = client.join().await {
        error!("Client {} failed: {:?}", client.id(), e);
        inner.release_faulted(client.id(), format!("{e:#}"));
    }
}
