mod common;

use anyhow::Result;
use bytes::Bytes;
use std::time::Duration;
use common::{WAIT, init_tracing, next, next_disconnect, next_received};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_chat_relay::codec::{Decoded, FrameReader, encode_frame};
use tokio_chat_relay::{
    Client, ClientConfig, ClientError, ClientEvent, DisconnectReason, PendingClient,
};

/// A started client plus the raw socket on the other end of it.
async fn client_with_raw_peer(
    config: ClientConfig,
) -> Result<(Client, tokio::sync::mpsc::UnboundedReceiver<ClientEvent>, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (pending, accepted) = tokio::join!(PendingClient::connect(addr, config), listener.accept());
    let pending = pending?;
    let (raw, _) = accepted?;
    let events = pending.subscribe();
    Ok((pending.start(), events, raw))
}

#[tokio::test]
async fn connect_fails_when_nothing_listens() -> Result<()> {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let err = PendingClient::connect(addr, ClientConfig::default())
        .await
        .err()
        .expect("connect should fail");
    assert!(format!("{err:#}").contains("failed to connect"));
    Ok(())
}

#[tokio::test]
async fn send_writes_one_length_prefixed_frame() -> Result<()> {
    init_tracing();
    let (client, mut events, mut raw) = client_with_raw_peer(ClientConfig::default()).await?;

    client.send("hello")?;
    assert_eq!(next(&mut events).await, Some(ClientEvent::Sent(Bytes::from("hello"))));

    let mut frame = [0u8; 9];
    timeout(WAIT, raw.read_exact(&mut frame)).await??;
    assert_eq!(&frame, &[5, 0, 0, 0, b'h', b'e', b'l', b'l', b'o']);
    Ok(())
}

#[tokio::test]
async fn incoming_frames_are_raised_as_received() -> Result<()> {
    init_tracing();
    let (_client, mut events, mut raw) = client_with_raw_peer(ClientConfig::default()).await?;

    raw.write_all(&encode_frame(b"first")?).await?;
    raw.write_all(&encode_frame(b"second")?).await?;

    assert_eq!(next_received(&mut events).await, Bytes::from("first"));
    assert_eq!(next_received(&mut events).await, Bytes::from("second"));
    Ok(())
}

#[tokio::test]
async fn concurrent_sends_keep_frames_intact_and_ordered() -> Result<()> {
    init_tracing();
    let (client, _events, raw) = client_with_raw_peer(ClientConfig::default()).await?;

    let sender = client.clone();
    let writer = tokio::spawn(async move {
        for i in 0..200u32 {
            sender.send(format!("message {i}")).unwrap();
        }
    });

    let mut reader = FrameReader::new(raw);
    for i in 0..200u32 {
        let decoded = timeout(WAIT, reader.read_frame()).await??;
        assert_eq!(decoded, Decoded::Message(Bytes::from(format!("message {i}"))));
    }
    writer.await?;
    Ok(())
}

#[tokio::test]
async fn silent_remote_close_is_one_graceful_disconnect() -> Result<()> {
    init_tracing();
    let (client, mut events, raw) = client_with_raw_peer(ClientConfig::default()).await?;

    drop(raw);

    assert_eq!(next_disconnect(&mut events).await, DisconnectReason::RemoteGraceful);
    assert!(!client.is_live());
    assert_eq!(client.disconnect_reason(), Some(DisconnectReason::RemoteGraceful));
    assert!(!client.disconnect(DisconnectReason::LocalRequest));
    timeout(WAIT, client.join()).await??;
    Ok(())
}

#[tokio::test]
async fn zero_length_frame_from_peer_closes_gracefully() -> Result<()> {
    init_tracing();
    let (_client, mut events, mut raw) = client_with_raw_peer(ClientConfig::default()).await?;

    raw.write_all(&[0, 0, 0, 0]).await?;

    assert_eq!(next_disconnect(&mut events).await, DisconnectReason::RemoteGraceful);
    Ok(())
}

#[tokio::test]
async fn disconnect_is_idempotent() -> Result<()> {
    init_tracing();
    let (client, mut events, mut raw) = client_with_raw_peer(ClientConfig::default()).await?;
    let mut late = client.subscribe();

    assert!(client.disconnect(DisconnectReason::LocalRequest));
    assert!(!client.disconnect(DisconnectReason::LocalRequest));
    assert!(!client.disconnect(DisconnectReason::ServerShutdown));

    assert_eq!(next_disconnect(&mut events).await, DisconnectReason::LocalRequest);
    assert_eq!(next_disconnect(&mut late).await, DisconnectReason::LocalRequest);
    assert_eq!(client.disconnect_reason(), Some(DisconnectReason::LocalRequest));

    // The socket is released: the peer reads end of stream.
    let mut buf = [0u8; 1];
    assert_eq!(timeout(WAIT, raw.read(&mut buf)).await??, 0);
    timeout(WAIT, client.join()).await??;
    Ok(())
}

#[tokio::test]
async fn send_after_disconnect_fails_immediately() -> Result<()> {
    init_tracing();
    let (client, _events, _raw) = client_with_raw_peer(ClientConfig::default()).await?;

    client.disconnect(DisconnectReason::LocalRequest);

    assert!(matches!(client.send("late"), Err(ClientError::Disconnected)));
    Ok(())
}

#[tokio::test]
async fn subscribing_after_close_yields_finished_stream() -> Result<()> {
    init_tracing();
    let (client, mut events, _raw) = client_with_raw_peer(ClientConfig::default()).await?;
    client.disconnect(DisconnectReason::LocalRequest);
    assert_eq!(next_disconnect(&mut events).await, DisconnectReason::LocalRequest);

    let mut late = client.subscribe();
    assert_eq!(next(&mut late).await, None);
    Ok(())
}

#[tokio::test]
#[allow(deprecated)]
async fn abrupt_reset_is_remote_abrupt() -> Result<()> {
    init_tracing();
    let (client, mut events, raw) = client_with_raw_peer(ClientConfig::default()).await?;

    // A zero linger turns the close into a reset.
    raw.set_linger(Some(Duration::ZERO))?;
    drop(raw);

    assert_eq!(next_disconnect(&mut events).await, DisconnectReason::RemoteAbrupt);
    assert_eq!(client.disconnect_reason(), Some(DisconnectReason::RemoteAbrupt));
    timeout(WAIT, client.join()).await??;
    Ok(())
}

#[tokio::test]
async fn connected_client_can_be_observed_later() -> Result<()> {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (client, accepted) =
        tokio::join!(Client::connect(addr, ClientConfig::default()), listener.accept());
    let client = client?;
    let (mut raw, _) = accepted?;
    assert_eq!(client.peer_addr(), addr);

    let mut events = client.subscribe();
    raw.write_all(&encode_frame(b"after subscribe")?).await?;
    assert_eq!(next_received(&mut events).await, Bytes::from("after subscribe"));
    Ok(())
}

#[tokio::test]
async fn empty_and_oversized_messages_are_rejected() -> Result<()> {
    init_tracing();
    let config = ClientConfig {
        max_frame_length: 8,
        ..ClientConfig::default()
    };
    let (client, _events, _raw) = client_with_raw_peer(config).await?;

    assert!(matches!(client.send(Bytes::new()), Err(ClientError::EmptyMessage)));
    assert!(matches!(client.send("nine bytes"), Err(ClientError::Frame(_))));
    assert!(client.is_live());
    Ok(())
}

#[tokio::test]
async fn oversized_incoming_frame_is_a_fault() -> Result<()> {
    init_tracing();
    let config = ClientConfig {
        max_frame_length: 16,
        ..ClientConfig::default()
    };
    let (client, mut events, mut raw) = client_with_raw_peer(config).await?;

    raw.write_all(&1000u32.to_le_bytes()).await?;

    // The stream ends without a Disconnected event and join reports the fault.
    assert_eq!(next(&mut events).await, None);
    assert!(!client.is_live());
    assert_eq!(client.disconnect_reason(), None);
    let err = timeout(WAIT, client.join()).await?.unwrap_err();
    assert!(format!("{err:#}").contains("exceeds the 16 byte limit"));
    Ok(())
}
