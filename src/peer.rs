//! Peer sessions (spec §4.2–§4.4): the admission handshake, announce
//! flooding, and discovery exchange with a remote node.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use rand::Rng;
use tokio::{
    io::{ReadHalf, WriteHalf},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, instrument, warn};

use crate::{
    error::GossipError,
    pow,
    state::{announce_fingerprint, NodeState},
    wire::{self, Frame},
};

/// Which side initiated the TCP connection (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Listener,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitInit,
    AwaitVerify,
    AwaitOk,
    Validated,
}

struct OutstandingChallenge {
    challenge: u64,
    deadline: Instant,
}

/// One message queued for the writer task: a fully-framed type+payload
/// pair, written with a single `write_all` + `flush`.
type OutboundMessage = (u16, Bytes);

pub struct PeerHandle {
    pub id: u64,
    pub remote_addr: IpAddr,
    pub role: Role,
    ephemeral_port: u16,
    advertised_listening_port: Mutex<Option<u16>>,
    /// Set only on the dialer side, for the lifetime of the handshake.
    challenge_sent: Mutex<Option<OutstandingChallenge>>,
    validated: AtomicBool,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl PeerHandle {
    fn new(
        id: u64,
        remote_addr: IpAddr,
        ephemeral_port: u16,
        advertised_listening_port: Option<u16>,
        role: Role,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote_addr,
            role,
            ephemeral_port,
            advertised_listening_port: Mutex::new(advertised_listening_port),
            challenge_sent: Mutex::new(None),
            validated: AtomicBool::new(false),
            outbound,
            tasks: Mutex::new(None),
        })
    }

    fn set_tasks(&self, reader: JoinHandle<()>, writer: JoinHandle<()>) {
        *self.tasks.lock() = Some((reader, writer));
    }

    pub fn is_validated(&self) -> bool {
        self.validated.load(Ordering::Acquire)
    }

    pub fn mark_validated(&self) {
        self.validated.store(true, Ordering::Release);
    }

    pub fn advertised_port(&self) -> Option<u16> {
        *self.advertised_listening_port.lock()
    }

    fn set_advertised_port(&self, port: u16) {
        *self.advertised_listening_port.lock() = Some(port);
    }

    /// `true` if `port` matches either the ephemeral source port this
    /// peer connected from or its advertised listening port (spec §4.4).
    pub fn matches_port(&self, port: u16) -> bool {
        self.ephemeral_port == port || self.advertised_port() == Some(port)
    }

    pub fn send(&self, msg_type: u16, payload: Bytes) {
        if self.outbound.send((msg_type, payload)).is_err() {
            debug!(peer = %self.remote_addr, "write to already-closed peer session dropped");
        }
    }

    /// Aborts both the reader and writer tasks, forcibly tearing down
    /// the TCP connection regardless of what either is blocked on
    /// (spec §4.7). `abort` cancels the reader task's future outright,
    /// so its post-loop cleanup (`state.remove_peer_from_all`) never
    /// runs — callers that close a peer still registered somewhere
    /// (e.g. the any-invalid validation branch) must remove it from
    /// the registry themselves first. Degree-eviction in
    /// `NodeState::promote_to_verified`/`register_unverified_peer`
    /// gets this for free since it `pop_front`s the evicted peer
    /// before calling `close`.
    pub fn close(&self) {
        if let Some((reader, writer)) = self.tasks.lock().take() {
            reader.abort();
            writer.abort();
        }
    }
}

async fn writer_loop(mut write_half: WriteHalf<TcpStream>, mut rx: mpsc::UnboundedReceiver<OutboundMessage>) {
    while let Some((msg_type, payload)) = rx.recv().await {
        if let Err(err) = wire::write_frame(&mut write_half, msg_type, &payload).await {
            debug!(%err, "peer write failed, closing writer loop");
            return;
        }
    }
}

/// Runs one peer session end to end: handshake, then dispatch loop,
/// until a fatal error or the socket closes. Spawned as a tokio task
/// by the caller (accept loop, bootstrap dial, or `PEER_BROADCAST`
/// dial-out).
#[instrument(name = "peer_session", skip(state, stream), fields(peer = %remote_addr))]
pub async fn run_peer_session(state: Arc<NodeState>, stream: TcpStream, remote_addr: SocketAddr, role: Role) {
    let ephemeral_port = remote_addr.port();
    let dialed_port = match role {
        Role::Dialer => Some(ephemeral_port),
        Role::Listener => None,
    };

    let (mut read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();

    let id = state.next_session_id();
    let handle = PeerHandle::new(id, remote_addr.ip(), ephemeral_port, dialed_port, role, tx);
    state.register_unverified_peer(handle.clone());
    debug!(peer = %handle.remote_addr, role = ?role, "peer session established");

    let writer_handle = tokio::spawn(writer_loop(write_half, rx));

    let state_for_reader = state.clone();
    let handle_for_reader = handle.clone();
    let reader_handle = tokio::spawn(async move {
        if let Err(err) = session_loop(&state_for_reader, &mut read_half, &handle_for_reader).await {
            warn!(peer = %handle_for_reader.remote_addr, %err, "peer session ended");
        }
        state_for_reader.remove_peer_from_all(&handle_for_reader);
        handle_for_reader.close();
    });

    // Stash both JoinHandles so an external evictor can abort this
    // session even while the reader task above is blocked on a read.
    handle.set_tasks(reader_handle, writer_handle);
}

async fn session_loop(
    state: &Arc<NodeState>,
    read_half: &mut ReadHalf<TcpStream>,
    handle: &Arc<PeerHandle>,
) -> Result<(), GossipError> {
    let mut session_state = match handle.role {
        Role::Dialer => {
            let challenge: u64 = rand::thread_rng().gen();
            let deadline = Instant::now() + Duration::from_secs(state.config.challenge_timeout);
            *handle.challenge_sent.lock() = Some(OutstandingChallenge { challenge, deadline });
            handle.send(wire::PEER_INIT, Bytes::copy_from_slice(&challenge.to_be_bytes()));
            SessionState::AwaitVerify
        }
        Role::Listener => SessionState::AwaitInit,
    };

    loop {
        let frame = wire::read_frame(read_half, wire::PEER_MIN_FRAME_SIZE).await?;
        session_state = handle_peer_frame(state, handle, session_state, frame).await?;
    }
}

async fn handle_peer_frame(
    state: &Arc<NodeState>,
    handle: &Arc<PeerHandle>,
    current: SessionState,
    frame: Frame,
) -> Result<SessionState, GossipError> {
    match (current, frame.msg_type) {
        (SessionState::AwaitInit, wire::PEER_INIT) => handle_peer_init(state, handle, frame.payload).await,
        (SessionState::AwaitVerify, wire::PEER_VERIFY) => handle_peer_verify(state, handle, frame.payload).await,
        (SessionState::AwaitOk, wire::PEER_OK) => {
            state.promote_to_verified(handle);
            Ok(SessionState::Validated)
        }
        (SessionState::Validated, wire::PEER_ANNOUNCE) => {
            handle_peer_announce(state, handle, frame.payload).await?;
            Ok(SessionState::Validated)
        }
        (SessionState::Validated, wire::PEER_DISCOVER) => {
            handle_peer_discover(state, handle).await;
            Ok(SessionState::Validated)
        }
        (SessionState::Validated, wire::PEER_BROADCAST) => {
            handle_peer_broadcast(state, frame.payload);
            Ok(SessionState::Validated)
        }
        (_, other) => Err(GossipError::UnexpectedForState(other)),
    }
}

async fn handle_peer_init(
    state: &Arc<NodeState>,
    handle: &Arc<PeerHandle>,
    mut payload: Bytes,
) -> Result<SessionState, GossipError> {
    if payload.len() < 8 {
        return Err(GossipError::MalformedFrame("PEER_INIT payload too short"));
    }
    let challenge = payload.get_u64();
    let listening_port = state.self_addr.port();
    let nonce = pow::find_nonce(challenge, listening_port, state.config.challenge_difficulty);

    let mut reply = bytes::BytesMut::with_capacity(12);
    reply.extend_from_slice(&0u16.to_be_bytes());
    reply.extend_from_slice(&listening_port.to_be_bytes());
    reply.extend_from_slice(&nonce.to_be_bytes());
    handle.send(wire::PEER_VERIFY, reply.freeze());
    Ok(SessionState::AwaitOk)
}

async fn handle_peer_verify(
    state: &Arc<NodeState>,
    handle: &Arc<PeerHandle>,
    mut payload: Bytes,
) -> Result<SessionState, GossipError> {
    if payload.len() < 12 {
        return Err(GossipError::MalformedFrame("PEER_VERIFY payload too short"));
    }
    let _reserved = payload.get_u16();
    let listening_port = payload.get_u16();
    let nonce = payload.get_u64();

    let outstanding = handle
        .challenge_sent
        .lock()
        .take()
        .ok_or(GossipError::UnexpectedForState(wire::PEER_VERIFY))?;
    if Instant::now() > outstanding.deadline {
        return Err(GossipError::HandshakeTimeout);
    }

    let hash = pow::digest(outstanding.challenge, nonce, listening_port);
    if !pow::meets_difficulty(&hash, state.config.challenge_difficulty) {
        return Err(GossipError::WeakProofOfWork);
    }

    handle.set_advertised_port(listening_port);
    state.promote_to_verified(handle);
    handle.send(wire::PEER_OK, Bytes::new());
    Ok(SessionState::Validated)
}

async fn handle_peer_announce(
    state: &Arc<NodeState>,
    handle: &Arc<PeerHandle>,
    payload: Bytes,
) -> Result<(), GossipError> {
    if payload.len() < 4 {
        return Err(GossipError::MalformedFrame("PEER_ANNOUNCE payload too short"));
    }
    let ttl = payload[0];
    let data_type = u16::from_be_bytes([payload[2], payload[3]]);
    let data = payload.slice(4..);

    let subscribers = state.subscribers_snapshot(data_type);
    if subscribers.is_empty() {
        return Ok(());
    }

    let fingerprint = announce_fingerprint(data_type, &data);
    if !state.check_and_record(fingerprint) {
        return Ok(());
    }

    let message_id = if ttl == 1 {
        // Step 3 allocates an id unconditionally; step 4 just decides
        // not to record a pending entry for it (spec §4.3).
        state.alloc_transient_message_id()
    } else {
        let next_ttl = if ttl == 0 { 0 } else { ttl - 1 };
        let ids = subscribers.iter().map(|s| s.id).collect();
        let source = Arc::downgrade(handle);
        state.insert_pending_validation(next_ttl, data_type, data.clone(), source, ids)
    };

    let notification = wire::encode_gossip_notification(message_id, data_type, &data);
    for subscriber in &subscribers {
        subscriber.send(wire::GOSSIP_NOTIFICATION, notification.clone());
    }
    Ok(())
}

async fn handle_peer_discover(state: &Arc<NodeState>, handle: &Arc<PeerHandle>) {
    let requester = Arc::downgrade(handle);
    let peers = state.verified_peers_except(&requester);
    let listing = peers
        .iter()
        .filter_map(|p| p.advertised_port().map(|port| format!("{}:{}", p.remote_addr, port)))
        .collect::<Vec<_>>()
        .join(",");
    if listing.is_empty() {
        return;
    }
    handle.send(wire::PEER_BROADCAST, Bytes::from(listing.into_bytes()));
}

fn handle_peer_broadcast(state: &Arc<NodeState>, payload: Bytes) {
    let text = match std::str::from_utf8(&payload) {
        Ok(text) => text,
        Err(_) => {
            warn!("PEER_BROADCAST payload is not valid UTF-8");
            return;
        }
    };

    for entry in text.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Ok(addr) = entry.parse::<SocketAddr>() else {
            warn!(entry, "PEER_BROADCAST entry is not a valid addr:port");
            continue;
        };
        if addr == state.self_addr {
            continue;
        }
        if state.has_duplicate_peer(addr.ip(), addr.port()) {
            continue;
        }
        let state = state.clone();
        tokio::spawn(async move {
            dial_peer(state, addr).await;
        });
    }
}

/// Connects to `addr` as a new outbound peer session (spec §4.4's
/// "otherwise dial" branch, and the one-shot bootstrap dial in §4.6).
#[instrument(skip(state))]
pub async fn dial_peer(state: Arc<NodeState>, addr: SocketAddr) {
    match TcpStream::connect(addr).await {
        Ok(stream) => run_peer_session(state, stream, addr, Role::Dialer).await,
        Err(err) => warn!(%addr, %err, "failed to dial peer"),
    }
}
