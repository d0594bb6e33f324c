use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_chat_relay::protocol::decode_utf16;
use tokio_chat_relay::{
    ChatMessage, ClientEvent, DisconnectReason, NetConfig, PendingClient, create_runtime,
};
use tracing::warn;

/// Line-based chat client: stdin lines go out, relayed lines are printed.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address.
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// Name shown in front of your messages.
    #[arg(short, long, default_value = "anonymous")]
    name: String,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => NetConfig::load(path)?,
        None => NetConfig::default(),
    };

    let runtime = create_runtime(&config.runtime)?;
    runtime.block_on(async move {
        let pending = PendingClient::connect(args.addr.as_str(), config.client).await?;
        let mut events = pending.subscribe();
        let client = pending.start();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        loop {
            tokio::select! {
                line = lines.next_line(), if stdin_open => match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        if let Err(e) = client.send(ChatMessage::new(&args.name, line).to_wire()) {
                            warn!("Message not sent: {}", e);
                        }
                    }
                    None => {
                        stdin_open = false;
                        client.disconnect(DisconnectReason::LocalRequest);
                    }
                },
                event = events.recv() => match event {
                    Some(ClientEvent::Received(payload) | ClientEvent::Sent(payload)) => {
                        match decode_utf16(&payload) {
                            Ok(text) => println!("{text}"),
                            Err(e) => warn!("Unreadable message: {}", e),
                        }
                    }
                    Some(ClientEvent::Disconnected(reason)) => {
                        println!("Disconnected: {reason}");
                        break;
                    }
                    None => break,
                },
            }
        }

        client.join().await
    })
}
