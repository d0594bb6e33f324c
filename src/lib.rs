//! Message-oriented networking over TCP.
//!
//! A [`Client`] exchanges discrete, length-prefixed messages over one
//! connection and reports what happens to it as [`ClientEvent`]s. A
//! [`ChatServer`] accepts many such connections, tracks the live ones and
//! relays each received message to the others.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod protocol;
pub mod runtime;
pub mod server;

// Re-export public items for convenience
pub use client::{Client, PendingClient};
pub use config::{ClientConfig, NetConfig, RelayMode, RuntimeConfig, ServerConfig};
pub use error::{ClientError, FrameError};
pub use event::{ClientEvent, ClientId, DisconnectReason, ServerEvent};
pub use protocol::ChatMessage;
pub use runtime::create_runtime;
pub use server::{ChatServer, ClientFactory};
