//! Peer-to-peer session synchronization for LAN watch parties: a framed
//! JSON control channel over TCP with a nonce-based password handshake,
//! heartbeat liveness, exponential-backoff reconnection, checksummed file
//! transfer, and durable state snapshots. Discovery, playback, and UI
//! live elsewhere; this crate only moves and guards the session state.

pub mod auth;
pub mod config;
pub mod envelope;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod snapshot;
pub mod transfer;
pub mod transport;

pub use auth::{HandshakeAction, JoinHandshake, PasswordHasher};
pub use config::{ReconnectConfig, SocketConfig, TransferConfig};
pub use envelope::DecodeError;
pub use protocol::{GameMessage, GameStateSnapshot, PasswordChallenge, VideoItem, PROTOCOL_VERSION};
pub use reconnect::{ReconnectionManager, ReconnectionState};
pub use session::GameSync;
pub use snapshot::SnapshotManager;
pub use transfer::{FileTransfer, FileTransferEvent, TransferError};
pub use transport::{NetworkError, NetworkEvent, NetworkManager, SocketNetworkManager};
