use clap::Parser;
use tokio_chat_relay::{ChatServer, NetConfig, RelayMode, ServerEvent, create_runtime};
use tracing::{error, info};

/// Relays chat messages between every connected client.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on, on all interfaces.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Echo every message back to its sender as well.
    #[arg(long)]
    broadcast: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => NetConfig::load(path)?,
        None => NetConfig::default(),
    };
    if args.broadcast {
        config.server.relay = RelayMode::Broadcast;
    }

    let runtime = create_runtime(&config.runtime)?;
    runtime.block_on(async move {
        console_subscriber::init();
        info!("Starting chat server on port {}", args.port);

        let server = ChatServer::new(config.server);
        let mut events = server.subscribe();
        server.start(args.port).await?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Some(ServerEvent::ClientConnected { id, addr }) => {
                        info!("Client {} joined from {} ({} online)", id, addr, server.client_count());
                    }
                    Some(ServerEvent::ClientDisconnected { id, reason }) => {
                        info!("Client {} left: {}", id, reason);
                    }
                    Some(ServerEvent::ClientFaulted { id, error }) => {
                        info!("Client {} dropped after an error: {}", id, error);
                    }
                    Some(ServerEvent::ListenerFailed { error }) => {
                        error!("No longer accepting connections: {}", error);
                        break;
                    }
                    Some(ServerEvent::Shutdown) | None => break,
                },
            }
        }

        server.shutdown().await
    })
}
