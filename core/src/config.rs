//! Tunable knobs for the transport, reconnection, and transfer layers.
//! Defaults match the production timings; tests shrink them.

use std::env;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8888;

#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Control-channel listen port. `0` asks the OS for an ephemeral port.
    pub port: u16,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// A peer silent for longer than this is force-disconnected.
    pub heartbeat_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
        }
    }
}

impl SocketConfig {
    /// Default config with the port overridable via `EMBER_PORT`.
    pub fn from_env() -> Self {
        let port = env::var("EMBER_PORT")
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        Self {
            port,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Cap on the exponential backoff, before jitter.
    pub max_delay: Duration,
    /// How long one attempt waits for `ClientConnected` before giving up.
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}
