use crate::codec::DEFAULT_MAX_FRAME_LENGTH;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What the server does with a message it receives from one of its clients.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Relay to every other client.
    #[default]
    Forward,
    /// Relay to every client, sender included.
    Broadcast,
}

/// Per-connection settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Largest payload accepted from the peer.
    pub max_frame_length: usize,
    /// Bound on the outbound connect. `None` waits as long as the OS does.
    pub connect_timeout_ms: Option<u64>,
    pub nodelay: bool,
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            connect_timeout_ms: Some(10_000),
            nodelay: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub relay: RelayMode,
    /// Applied to every accepted connection by the default factory.
    pub client: ClientConfig,
    /// First pause after a failed `accept`, doubled on each consecutive failure.
    pub accept_backoff_ms: u64,
    /// Consecutive failed accepts tolerated before the listener gives up.
    pub max_accept_retries: u32,
}

impl ServerConfig {
    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            relay: RelayMode::default(),
            client: ClientConfig::default(),
            accept_backoff_ms: 50,
            max_accept_retries: 10,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Defaults to the number of CPUs.
    pub worker_threads: Option<usize>,
    pub thread_name: String,
    pub thread_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: None,
            thread_name: "tokio-chat-worker".to_string(),
            thread_stack_size: 3 * 1024 * 1024,
        }
    }
}

/// Top-level configuration, as read from a JSON file.
///
/// Every field is optional; missing ones take their defaults:
///
/// ```json
/// { "server": { "relay": "broadcast" }, "runtime": { "worker_threads": 2 } }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct NetConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub runtime: RuntimeConfig,
}

impl NetConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&json)
    }
}
