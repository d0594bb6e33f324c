#![allow(dead_code)]

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_chat_relay::{
    ChatServer, Client, ClientConfig, ClientEvent, ClientId, PendingClient, RelayMode,
    ServerConfig, ServerEvent,
};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub async fn next<E>(rx: &mut UnboundedReceiver<E>) -> Option<E> {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an event")
}

/// Next received message, skipping `Sent` notifications.
pub async fn next_received(rx: &mut UnboundedReceiver<ClientEvent>) -> Bytes {
    loop {
        match next(rx).await {
            Some(ClientEvent::Received(message)) => return message,
            Some(ClientEvent::Sent(_)) => continue,
            other => panic!("expected a message, got {other:?}"),
        }
    }
}

/// Asserts nothing but `Sent` notifications arrive within `quiet`.
pub async fn expect_no_message(rx: &mut UnboundedReceiver<ClientEvent>, quiet: Duration) {
    let deadline = Instant::now() + quiet;
    loop {
        match timeout_at(deadline, rx.recv()).await {
            Err(_) => return,
            Ok(Some(ClientEvent::Sent(_))) => continue,
            Ok(other) => panic!("expected silence, got {other:?}"),
        }
    }
}

/// Waits for the client's `Disconnected` event and checks the channel ends.
pub async fn next_disconnect(
    rx: &mut UnboundedReceiver<ClientEvent>,
) -> tokio_chat_relay::DisconnectReason {
    loop {
        match next(rx).await {
            Some(ClientEvent::Disconnected(reason)) => {
                assert_eq!(next(rx).await, None, "events after Disconnected");
                return reason;
            }
            Some(ClientEvent::Sent(_) | ClientEvent::Received(_)) => continue,
            None => panic!("event stream ended without Disconnected"),
        }
    }
}

pub async fn start_server(relay: RelayMode) -> (ChatServer, SocketAddr, UnboundedReceiver<ServerEvent>) {
    let server = ChatServer::new(ServerConfig {
        relay,
        ..ServerConfig::default()
    });
    let events = server.subscribe();
    let addr = server
        .start_on("127.0.0.1:0")
        .await
        .expect("server failed to start");
    (server, addr, events)
}

pub async fn connect(addr: SocketAddr) -> (Client, UnboundedReceiver<ClientEvent>) {
    let pending = PendingClient::connect(addr, ClientConfig::default())
        .await
        .expect("connect failed");
    let events = pending.subscribe();
    (pending.start(), events)
}

/// Waits until the server has announced `count` new clients.
pub async fn wait_connected(
    events: &mut UnboundedReceiver<ServerEvent>,
    count: usize,
) -> Vec<ClientId> {
    let mut ids = Vec::with_capacity(count);
    while ids.len() < count {
        match next(events).await {
            Some(ServerEvent::ClientConnected { id, .. }) => ids.push(id),
            other => panic!("expected ClientConnected, got {other:?}"),
        }
    }
    ids
}
