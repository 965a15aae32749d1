//! Shared harness for the scenario tests in `tests/scenarios.rs`: spins
//! up a real `NodeState` behind real TCP listeners (driven by the
//! library's own session code, exactly as `main` wires it), then
//! drives it from raw sockets playing the other side of the wire
//! protocol.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use gossip_relay::{
    config::Config,
    peer::{self, Role},
    pow,
    state::NodeState,
    wire,
};
use tokio::net::{TcpListener, TcpStream};

pub fn test_config(degree: usize, cache_size: usize, challenge_difficulty: u8, challenge_timeout: u64) -> Config {
    Config {
        hostkey: "node.pem".into(),
        cache_size,
        degree,
        // Unused directly by these tests: nothing here relies on the
        // process-level bootstrap dial or discovery loop, both of
        // which live in `main.rs`, not the library.
        bootstrapper: "127.0.0.1:1".into(),
        p2p_address: "127.0.0.1:0".into(),
        api_address: "127.0.0.1:0".into(),
        challenge_timeout,
        challenge_difficulty,
        discovery_cooldown: 3600,
    }
}

pub struct TestNode {
    pub state: Arc<NodeState>,
    pub p2p_addr: SocketAddr,
    pub api_addr: SocketAddr,
}

/// Binds real ephemeral-port listeners and spawns the same accept-loop
/// shape `main.rs` runs, using the library's session entry points
/// directly.
pub async fn spawn_node(config: Config) -> TestNode {
    let p2p_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let p2p_addr = p2p_listener.local_addr().unwrap();
    let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api_addr = api_listener.local_addr().unwrap();

    let state = Arc::new(NodeState::new(config, p2p_addr));

    {
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                if let Ok((stream, remote_addr)) = p2p_listener.accept().await {
                    tokio::spawn(peer::run_peer_session(state.clone(), stream, remote_addr, Role::Listener));
                }
            }
        });
    }
    {
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                if let Ok((stream, remote_addr)) = api_listener.accept().await {
                    tokio::spawn(gossip_relay::api::run_api_session(state.clone(), stream, remote_addr));
                }
            }
        });
    }

    TestNode { state, p2p_addr, api_addr }
}

pub async fn connect_api(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

pub async fn send_notify(stream: &mut TcpStream, data_type: u16) {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&data_type.to_be_bytes());
    wire::write_frame(stream, wire::GOSSIP_NOTIFY, &payload).await.unwrap();
}

pub async fn send_api_announce(stream: &mut TcpStream, ttl: u8, data_type: u16, data: &[u8]) {
    let payload = wire::encode_peer_announce(ttl, data_type, data);
    wire::write_frame(stream, wire::GOSSIP_ANNOUNCE, &payload).await.unwrap();
}

pub async fn send_validation(stream: &mut TcpStream, message_id: u16, valid: bool) {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&message_id.to_be_bytes());
    payload.extend_from_slice(&(valid as u16).to_be_bytes());
    wire::write_frame(stream, wire::GOSSIP_VALIDATION, &payload).await.unwrap();
}

pub async fn send_peer_announce(stream: &mut TcpStream, ttl: u8, data_type: u16, data: &[u8]) {
    let payload = wire::encode_peer_announce(ttl, data_type, data);
    wire::write_frame(stream, wire::PEER_ANNOUNCE, &payload).await.unwrap();
}

pub async fn recv(stream: &mut TcpStream, min_size: u16) -> wire::Frame {
    wire::read_frame(stream, min_size).await.unwrap()
}

pub async fn recv_with_timeout(stream: &mut TcpStream, min_size: u16, timeout: Duration) -> Option<wire::Frame> {
    tokio::time::timeout(timeout, wire::read_frame(stream, min_size))
        .await
        .ok()
        .and_then(|r| r.ok())
}

/// Connects to the node's peer listener and completes the admission
/// handshake playing the **dialer/challenger** role (spec §4.2): the
/// node's accept loop always runs `Role::Listener`/prover, so every
/// raw socket in these tests plays the opposite, dialer, side. Sends
/// `PEER_INIT`, verifies the node's returned `PEER_VERIFY` proof
/// against `difficulty`, then sends `PEER_OK`. Returns the live
/// stream, now `Validated` on the node's side.
pub async fn connect_as_peer(node: &TestNode, challenge: u64, difficulty: u8) -> TcpStream {
    let mut stream = TcpStream::connect(node.p2p_addr).await.unwrap();
    wire::write_frame(&mut stream, wire::PEER_INIT, &challenge.to_be_bytes()).await.unwrap();
    let frame = recv(&mut stream, wire::PEER_MIN_FRAME_SIZE).await;
    assert_eq!(frame.msg_type, wire::PEER_VERIFY);
    let payload = frame.payload;
    let listening_port = u16::from_be_bytes([payload[2], payload[3]]);
    let nonce = u64::from_be_bytes(payload[4..12].try_into().unwrap());
    assert!(pow::meets_difficulty(&pow::digest(challenge, nonce, listening_port), difficulty));
    wire::write_frame(&mut stream, wire::PEER_OK, &[]).await.unwrap();
    stream
}

/// Spawns a raw TCP listener that plays the **listener/prover** side
/// of the handshake (spec §4.2) against a node acting as dialer
/// (`peer::dial_peer`): awaits `PEER_INIT`, replies `PEER_VERIFY` with
/// either a genuine proof (`valid=true`) or a deliberately wrong
/// `nonce=0` (`valid=false`), then awaits `PEER_OK` only in the
/// genuine case. Returns the bound address to dial.
pub async fn spawn_fake_prover(listening_port: u16, difficulty: u8, valid: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else { return };
        let Ok(frame) = wire::read_frame(&mut stream, wire::PEER_MIN_FRAME_SIZE).await else { return };
        let challenge = u64::from_be_bytes(frame.payload[..8].try_into().unwrap());
        let nonce = if valid { pow::find_nonce(challenge, listening_port, difficulty) } else { 0 };
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.extend_from_slice(&listening_port.to_be_bytes());
        payload.extend_from_slice(&nonce.to_be_bytes());
        if wire::write_frame(&mut stream, wire::PEER_VERIFY, &payload).await.is_err() {
            return;
        }
        if valid {
            let _ = wire::read_frame(&mut stream, wire::PEER_MIN_FRAME_SIZE).await;
        } else {
            // Keep the socket open briefly so the dialer's rejection
            // is observed as a clean close from its own side, not a
            // race against our own teardown.
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });
    addr
}
