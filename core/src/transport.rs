//! TCP transport: one listener, a registry of live peer connections with a
//! read and a write task each, heartbeat keepalive, and a shared event
//! stream. No method here returns an error; every failure becomes an
//! `Error` event or an implicit `ClientDisconnected`.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::auth::PasswordHasher;
use crate::config::SocketConfig;
use crate::envelope;
use crate::protocol::{GameMessage, PasswordChallenge, PROTOCOL_VERSION};

const EVENT_CAPACITY: usize = 256;

/// Transport failures reported on the event stream.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
    #[error("failed to accept connection: {reason}")]
    Accept { reason: String },
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },
}

#[derive(Debug, Clone)]
pub enum NetworkEvent {
    DataReceived { message: GameMessage, sender: String },
    ClientConnected(String),
    ClientDisconnected(String),
    Error(NetworkError),
}

/// The transport surface the rest of the stack programs against. Methods
/// never block and never fail; long-running work happens on spawned tasks,
/// so implementations are constructed inside a tokio runtime.
pub trait NetworkManager: Send + Sync + 'static {
    /// Subscribe to the shared event stream. Subscribe *before* triggering
    /// connects so early events are not missed.
    fn events(&self) -> broadcast::Receiver<NetworkEvent>;
    fn start_server(&self);
    fn connect_to(&self, host: &str, port: u16);
    fn broadcast(&self, message: &GameMessage);
    /// Read-once lookup of the nonce issued to `address`; a second call
    /// for the same address returns `None`.
    fn consume_nonce(&self, address: &str) -> Option<String>;
    fn shutdown(&self);
}

struct ConnectionHandle {
    frame_tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
    writer: JoinHandle<()>,
}

struct Shared {
    config: SocketConfig,
    clients: DashMap<String, ConnectionHandle>,
    last_heartbeat: DashMap<String, Instant>,
    nonces: DashMap<String, String>,
    hasher: PasswordHasher,
    events_tx: broadcast::Sender<NetworkEvent>,
    closed: AtomicBool,
}

pub struct SocketNetworkManager {
    shared: Arc<Shared>,
    port: u16,
    listener: Mutex<Option<TcpListener>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SocketNetworkManager {
    /// Binds the control-channel listener (port 0 for OS-assigned) and
    /// starts the heartbeat task. Accepting begins with `start_server`.
    pub async fn bind(config: SocketConfig) -> io::Result<Self> {
        Self::bind_with_hasher(config, PasswordHasher::new()).await
    }

    /// Same, with an injected nonce source (seeded in tests).
    pub async fn bind_with_hasher(config: SocketConfig, hasher: PasswordHasher) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let port = listener.local_addr()?.port();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            config,
            clients: DashMap::new(),
            last_heartbeat: DashMap::new(),
            nonces: DashMap::new(),
            hasher,
            events_tx,
            closed: AtomicBool::new(false),
        });
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&shared)));
        Ok(Self {
            shared,
            port,
            listener: Mutex::new(Some(listener)),
            background: Mutex::new(vec![heartbeat]),
        })
    }

    /// The port the listener is actually bound to.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl NetworkManager for SocketNetworkManager {
    fn events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.shared.events_tx.subscribe()
    }

    fn start_server(&self) {
        let Some(listener) = self.listener.lock().take() else {
            tracing::warn!("start_server called twice, ignoring");
            return;
        };
        tracing::info!("accepting peers on port {}", self.port);
        let shared = Arc::clone(&self.shared);
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        shared.register(stream, peer.to_string(), true);
                    }
                    Err(e) => {
                        tracing::error!("accept failed: {e}");
                        shared.emit(NetworkEvent::Error(NetworkError::Accept {
                            reason: e.to_string(),
                        }));
                        // Transient accept errors (fd pressure) should not
                        // spin the loop.
                        sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });
        self.background.lock().push(accept);
    }

    fn connect_to(&self, host: &str, port: u16) {
        let shared = Arc::clone(&self.shared);
        let target = format!("{host}:{port}");
        let dial = tokio::spawn(async move {
            match timeout(shared.config.connect_timeout, TcpStream::connect(&*target)).await {
                Ok(Ok(stream)) => {
                    let addr = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| target.clone());
                    tracing::info!("connected to {addr}");
                    shared.register(stream, addr, false);
                }
                Ok(Err(e)) => {
                    tracing::error!("connect to {target} failed: {e}");
                    shared.emit(NetworkEvent::Error(NetworkError::Connect {
                        addr: target,
                        reason: e.to_string(),
                    }));
                }
                Err(_) => {
                    tracing::error!("connect to {target} timed out");
                    shared.emit(NetworkEvent::Error(NetworkError::Connect {
                        addr: target,
                        reason: "connect timed out".into(),
                    }));
                }
            }
        });
        self.background.lock().push(dial);
    }

    fn broadcast(&self, message: &GameMessage) {
        let frame = match envelope::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("failed to encode broadcast: {e}");
                return;
            }
        };
        // Snapshot of the registry at call time; later joiners miss out.
        let peers: Vec<(String, mpsc::UnboundedSender<Vec<u8>>)> = self
            .shared
            .clients
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().frame_tx.clone()))
            .collect();
        for (addr, frame_tx) in peers {
            if frame_tx.send(frame.clone()).is_err() {
                tracing::debug!("broadcast to {addr} dropped, connection is closing");
            }
        }
    }

    fn consume_nonce(&self, address: &str) -> Option<String> {
        self.shared.nonces.remove(address).map(|(_, nonce)| nonce)
    }

    fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listener.lock().take();
        for task in self.background.lock().drain(..) {
            task.abort();
        }
        let addrs: Vec<String> = self
            .shared
            .clients
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for addr in addrs {
            self.shared.remove_connection(&addr);
        }
        self.shared.nonces.clear();
        tracing::info!("transport shut down");
    }
}

impl Shared {
    fn emit(&self, event: NetworkEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Wires up a freshly accepted or dialed socket: write task fed by a
    /// frame queue, then (listener side) the password challenge, then the
    /// read task.
    fn register(self: &Arc<Self>, stream: TcpStream, addr: String, issue_challenge: bool) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let (read_half, write_half) = stream.into_split();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(
            Arc::clone(self),
            addr.clone(),
            write_half,
            frame_rx,
        ));
        if let Some(stale) = self.clients.insert(
            addr.clone(),
            ConnectionHandle {
                frame_tx: frame_tx.clone(),
                reader: None,
                writer,
            },
        ) {
            // Same peer address reconnected before the old entry was
            // reaped; drop the old tasks without a disconnect event.
            if let Some(reader) = stale.reader {
                reader.abort();
            }
            stale.writer.abort();
        }
        self.last_heartbeat.insert(addr.clone(), Instant::now());

        if issue_challenge {
            let nonce = self.hasher.generate_nonce();
            self.nonces.insert(addr.clone(), nonce.clone());
            let challenge = GameMessage::PasswordChallenge(PasswordChallenge {
                nonce,
                protocol_version: PROTOCOL_VERSION,
            });
            match envelope::encode(&challenge) {
                Ok(frame) => {
                    let _ = frame_tx.send(frame);
                }
                Err(e) => tracing::error!("failed to encode password challenge: {e}"),
            }
        }

        // Announce before the read task starts so `ClientConnected` always
        // precedes this connection's `DataReceived` events.
        self.emit(NetworkEvent::ClientConnected(addr.clone()));

        let reader = tokio::spawn(read_loop(Arc::clone(self), addr.clone(), read_half));
        if let Some(mut entry) = self.clients.get_mut(&addr) {
            entry.reader = Some(reader);
        } else {
            // The write task already tore the connection down.
            reader.abort();
        }
    }

    /// Unregisters `addr`, emitting exactly one `ClientDisconnected` no
    /// matter which task noticed the failure first.
    fn remove_connection(&self, addr: &str) {
        let Some((_, handle)) = self.clients.remove(addr) else {
            return;
        };
        self.last_heartbeat.remove(addr);
        self.nonces.remove(addr);
        tracing::info!("peer {addr} disconnected");
        self.emit(NetworkEvent::ClientDisconnected(addr.to_string()));
        if let Some(reader) = handle.reader {
            reader.abort();
        }
        handle.writer.abort();
    }
}

async fn read_loop(shared: Arc<Shared>, addr: String, mut read_half: OwnedReadHalf) {
    loop {
        match envelope::read_from(&mut read_half).await {
            Ok(GameMessage::Heartbeat { .. }) => {
                shared.last_heartbeat.insert(addr.clone(), Instant::now());
            }
            Ok(message) => {
                shared.last_heartbeat.insert(addr.clone(), Instant::now());
                shared.emit(NetworkEvent::DataReceived {
                    message,
                    sender: addr.clone(),
                });
            }
            Err(e) => {
                // EOF, socket error, or corrupt frame: all connection-fatal.
                tracing::debug!("read loop for {addr} ended: {e}");
                break;
            }
        }
    }
    shared.remove_connection(&addr);
}

async fn write_loop(
    shared: Arc<Shared>,
    addr: String,
    mut write_half: OwnedWriteHalf,
    mut frame_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = frame_rx.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            tracing::warn!("write to {addr} failed: {e}");
            shared.remove_connection(&addr);
            return;
        }
    }
    // Queue closed: the registry entry is already gone.
}

async fn heartbeat_loop(shared: Arc<Shared>) {
    loop {
        sleep(shared.config.heartbeat_interval).await;

        let frame = match envelope::encode(&GameMessage::heartbeat()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("failed to encode heartbeat: {e}");
                continue;
            }
        };
        let peers: Vec<(String, mpsc::UnboundedSender<Vec<u8>>)> = shared
            .clients
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().frame_tx.clone()))
            .collect();
        for (addr, frame_tx) in peers {
            if frame_tx.send(frame.clone()).is_err() {
                tracing::warn!("heartbeat to {addr} not queued, connection is closing");
            }
        }

        let now = Instant::now();
        let expired: Vec<String> = shared
            .last_heartbeat
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) > shared.config.heartbeat_timeout)
            .map(|entry| entry.key().clone())
            .collect();
        for addr in expired {
            tracing::warn!("peer {addr} missed heartbeats, closing");
            shared.remove_connection(&addr);
        }
    }
}
