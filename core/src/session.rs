//! Facade the orchestration layer talks to: one transport plus the
//! reconnection loop wired to it.

use std::io;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::config::{ReconnectConfig, SocketConfig};
use crate::protocol::GameMessage;
use crate::reconnect::{ReconnectionManager, ReconnectionState};
use crate::transport::{NetworkEvent, NetworkManager, SocketNetworkManager};

pub struct GameSync<N: NetworkManager> {
    transport: Arc<N>,
    reconnection: ReconnectionManager<N>,
}

impl GameSync<SocketNetworkManager> {
    /// Socket-backed session with the given transport knobs and default
    /// reconnection behavior.
    pub async fn open(config: SocketConfig) -> io::Result<Self> {
        let transport = Arc::new(SocketNetworkManager::bind(config).await?);
        Ok(Self::new(transport, ReconnectConfig::default()))
    }

    /// The control-channel port actually bound.
    pub fn port(&self) -> u16 {
        self.transport.port()
    }
}

impl<N: NetworkManager> GameSync<N> {
    pub fn new(transport: Arc<N>, reconnect: ReconnectConfig) -> Self {
        let reconnection = ReconnectionManager::new(Arc::clone(&transport), reconnect);
        Self {
            transport,
            reconnection,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.transport.events()
    }

    pub fn start_server(&self) {
        self.transport.start_server();
    }

    pub fn connect_to(&self, host: &str, port: u16) {
        self.transport.connect_to(host, port);
    }

    pub fn broadcast(&self, message: &GameMessage) {
        self.transport.broadcast(message);
    }

    pub fn consume_nonce(&self, address: &str) -> Option<String> {
        self.transport.consume_nonce(address)
    }

    pub fn start_reconnecting(&self, host: &str, port: u16) {
        self.reconnection.start_reconnecting(host, port);
    }

    pub fn stop_reconnecting(&self) {
        self.reconnection.stop_reconnecting();
    }

    pub fn reconnection_state(&self) -> watch::Receiver<ReconnectionState> {
        self.reconnection.state()
    }

    pub fn transport(&self) -> &Arc<N> {
        &self.transport
    }

    /// Stops reconnection first so it cannot redial a transport that is
    /// being torn down, then closes the transport. Idempotent.
    pub fn shutdown(&self) {
        self.reconnection.shutdown();
        self.transport.shutdown();
    }
}
