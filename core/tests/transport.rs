//! Loopback tests for the socket transport: challenge issuance, nonce
//! consumption, broadcast fan-out, heartbeat expiry, and teardown.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use ember_core::config::SocketConfig;
use ember_core::envelope;
use ember_core::protocol::{GameMessage, PROTOCOL_VERSION};
use ember_core::transport::{NetworkError, NetworkEvent, NetworkManager, SocketNetworkManager};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ember_core=debug".into()),
        )
        .try_init();
}

fn test_config() -> SocketConfig {
    SocketConfig {
        port: 0,
        ..SocketConfig::default()
    }
}

async fn next_event(events: &mut broadcast::Receiver<NetworkEvent>) -> NetworkEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a network event")
        .expect("event stream closed")
}

async fn wait_for_connected(events: &mut broadcast::Receiver<NetworkEvent>) -> String {
    loop {
        if let NetworkEvent::ClientConnected(addr) = next_event(events).await {
            return addr;
        }
    }
}

async fn wait_for_disconnect(events: &mut broadcast::Receiver<NetworkEvent>, addr: &str) {
    loop {
        if let NetworkEvent::ClientDisconnected(gone) = next_event(events).await {
            if gone == addr {
                return;
            }
        }
    }
}

/// Drains events for a short window, counting disconnects for `addr`.
async fn count_disconnects(events: &mut broadcast::Receiver<NetworkEvent>, addr: &str) -> usize {
    let mut count = 0;
    loop {
        match timeout(Duration::from_millis(300), events.recv()).await {
            Ok(Ok(NetworkEvent::ClientDisconnected(gone))) if gone == addr => count += 1,
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => return count,
        }
    }
}

#[tokio::test]
async fn accepted_peers_get_a_password_challenge() {
    init_tracing();
    let server = SocketNetworkManager::bind(test_config()).await.unwrap();
    server.start_server();

    let mut stream = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
    match envelope::read_from(&mut stream).await.unwrap() {
        GameMessage::PasswordChallenge(challenge) => {
            assert_eq!(challenge.nonce.len(), 64);
            assert!(challenge.nonce.chars().all(|c| c.is_ascii_hexdigit()));
            assert_eq!(challenge.protocol_version, PROTOCOL_VERSION);
        }
        other => panic!("expected a challenge, got {other:?}"),
    }
    server.shutdown();
}

#[tokio::test]
async fn nonce_is_consumed_exactly_once() {
    init_tracing();
    let server = SocketNetworkManager::bind(test_config()).await.unwrap();
    let mut events = server.events();
    server.start_server();

    let mut stream = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
    let addr = wait_for_connected(&mut events).await;
    assert_eq!(addr, stream.local_addr().unwrap().to_string());

    let nonce = match envelope::read_from(&mut stream).await.unwrap() {
        GameMessage::PasswordChallenge(challenge) => challenge.nonce,
        other => panic!("expected a challenge, got {other:?}"),
    };

    assert_eq!(server.consume_nonce(&addr), Some(nonce));
    // Read-once: a replayed password message finds nothing to check against.
    assert_eq!(server.consume_nonce(&addr), None);
    server.shutdown();
}

#[tokio::test]
async fn broadcast_reaches_all_peers_and_survives_one_loss() {
    init_tracing();
    let server = SocketNetworkManager::bind(test_config()).await.unwrap();
    let mut events = server.events();
    server.start_server();

    let mut peers = Vec::new();
    for _ in 0..3 {
        let mut stream = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
        wait_for_connected(&mut events).await;
        // Swallow the greeting so the next frame is the broadcast.
        let _ = envelope::read_from(&mut stream).await.unwrap();
        peers.push(stream);
    }

    let first = GameMessage::PlaybackState {
        video_index: 4,
        playback_position: 1234,
        play_when_ready: true,
    };
    server.broadcast(&first);
    for peer in &mut peers {
        assert_eq!(envelope::read_from(peer).await.unwrap(), first);
    }

    let dropped = peers.remove(0);
    let dropped_addr = dropped.local_addr().unwrap().to_string();
    drop(dropped);
    wait_for_disconnect(&mut events, &dropped_addr).await;

    let second = GameMessage::PlaybackState {
        video_index: 5,
        playback_position: 0,
        play_when_ready: false,
    };
    server.broadcast(&second);
    for peer in &mut peers {
        assert_eq!(envelope::read_from(peer).await.unwrap(), second);
    }

    // The loss produced exactly one disconnect, already consumed above.
    assert_eq!(count_disconnects(&mut events, &dropped_addr).await, 0);
    server.shutdown();
}

#[tokio::test]
async fn heartbeats_are_swallowed_and_data_is_surfaced() {
    init_tracing();
    let server = SocketNetworkManager::bind(test_config()).await.unwrap();
    let mut events = server.events();
    server.start_server();

    let mut stream = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
    let addr = wait_for_connected(&mut events).await;
    let _ = envelope::read_from(&mut stream).await.unwrap();

    let heartbeat = envelope::encode(&GameMessage::Heartbeat { timestamp: 1 }).unwrap();
    stream.write_all(&heartbeat).await.unwrap();
    let data = GameMessage::PasswordResponse { success: true };
    stream.write_all(&envelope::encode(&data).unwrap()).await.unwrap();

    // The heartbeat never surfaces; the first data event is the response.
    match next_event(&mut events).await {
        NetworkEvent::DataReceived { message, sender } => {
            assert_eq!(message, data);
            assert_eq!(sender, addr);
        }
        other => panic!("expected DataReceived, got {other:?}"),
    }
    server.shutdown();
}

#[tokio::test]
async fn silent_peer_is_force_disconnected() {
    init_tracing();
    let config = SocketConfig {
        port: 0,
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(200),
        ..SocketConfig::default()
    };
    let server = SocketNetworkManager::bind(config).await.unwrap();
    let mut events = server.events();
    server.start_server();

    let stream = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
    let addr = wait_for_connected(&mut events).await;

    // Never write anything: no read error occurs on the server, but the
    // idle scan must still reap the connection.
    wait_for_disconnect(&mut events, &addr).await;
    assert_eq!(count_disconnects(&mut events, &addr).await, 0);

    drop(stream);
    server.shutdown();
}

#[tokio::test]
async fn failed_dial_becomes_an_error_event() {
    init_tracing();
    let manager = SocketNetworkManager::bind(test_config()).await.unwrap();
    let mut events = manager.events();

    // A port with nothing behind it.
    let dead = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = dead.local_addr().unwrap().port();
    drop(dead);

    manager.connect_to("127.0.0.1", port);
    match next_event(&mut events).await {
        NetworkEvent::Error(NetworkError::Connect { addr, .. }) => {
            assert_eq!(addr, format!("127.0.0.1:{port}"));
        }
        other => panic!("expected a connect error, got {other:?}"),
    }
    manager.shutdown();
}

#[tokio::test]
async fn two_managers_exchange_messages_both_ways() {
    init_tracing();
    let host = SocketNetworkManager::bind(test_config()).await.unwrap();
    let mut host_events = host.events();
    host.start_server();

    let member = SocketNetworkManager::bind(test_config()).await.unwrap();
    let mut member_events = member.events();
    member.connect_to("127.0.0.1", host.port());

    wait_for_connected(&mut member_events).await;
    wait_for_connected(&mut host_events).await;

    // The greeting challenge arrives as ordinary data on the member side.
    let nonce = loop {
        if let NetworkEvent::DataReceived {
            message: GameMessage::PasswordChallenge(challenge),
            ..
        } = next_event(&mut member_events).await
        {
            break challenge.nonce;
        }
    };
    assert_eq!(nonce.len(), 64);

    member.broadcast(&GameMessage::Password {
        password_hash: "ab".repeat(32),
    });
    match next_event(&mut host_events).await {
        NetworkEvent::DataReceived { message, .. } => {
            assert!(matches!(message, GameMessage::Password { .. }))
        }
        other => panic!("expected the password message, got {other:?}"),
    }

    host.broadcast(&GameMessage::PasswordResponse { success: true });
    match next_event(&mut member_events).await {
        NetworkEvent::DataReceived { message, .. } => {
            assert_eq!(message, GameMessage::PasswordResponse { success: true })
        }
        other => panic!("expected the password response, got {other:?}"),
    }

    // Tearing down the host disconnects the member, and shutdown is
    // idempotent on both sides.
    host.shutdown();
    host.shutdown();
    loop {
        if let NetworkEvent::ClientDisconnected(_) = next_event(&mut member_events).await {
            break;
        }
    }
    member.shutdown();
    member.shutdown();
}
