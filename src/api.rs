//! API sessions (spec §4.5): one handler per local client, speaking
//! `GOSSIP_ANNOUNCE` / `GOSSIP_NOTIFY` / `GOSSIP_VALIDATION` and
//! receiving `GOSSIP_NOTIFICATION` in return.

use std::{
    net::SocketAddr,
    sync::Arc,
};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::{
    io::{ReadHalf, WriteHalf},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, instrument, warn};

use crate::{
    error::GossipError,
    state::{NodeState, ValidationOutcome},
    wire::{self, Frame},
};

type OutboundMessage = (u16, Bytes);

/// A connected local client. Identity is by session object (per spec
/// §3), `remote_addr` is metadata only.
pub struct ApiHandle {
    pub id: u64,
    pub remote_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl ApiHandle {
    fn new(id: u64, remote_addr: SocketAddr, outbound: mpsc::UnboundedSender<OutboundMessage>) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote_addr,
            outbound,
            tasks: Mutex::new(None),
        })
    }

    fn set_tasks(&self, reader: JoinHandle<()>, writer: JoinHandle<()>) {
        *self.tasks.lock() = Some((reader, writer));
    }

    pub fn send(&self, msg_type: u16, payload: Bytes) {
        if self.outbound.send((msg_type, payload)).is_err() {
            debug!(client = %self.remote_addr, "write to already-closed API session dropped");
        }
    }

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
            debug!(%err, "API client write failed, closing writer loop");
            return;
        }
    }
}

/// Runs one API session end to end until a fatal error or socket
/// close. Spawned as a tokio task by the API accept loop.
#[instrument(name = "api_session", skip(state, stream), fields(client = %remote_addr))]
pub async fn run_api_session(state: Arc<NodeState>, stream: TcpStream, remote_addr: SocketAddr) {
    let (mut read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();

    let id = state.next_session_id();
    let handle = ApiHandle::new(id, remote_addr, tx);
    state.register_api_session(handle.clone());
    debug!(client = %remote_addr, "API session established");

    let writer_handle = tokio::spawn(writer_loop(write_half, rx));

    let state_for_reader = state.clone();
    let handle_for_reader = handle.clone();
    let reader_handle = tokio::spawn(async move {
        if let Err(err) = session_loop(&state_for_reader, &mut read_half, &handle_for_reader).await {
            warn!(client = %handle_for_reader.remote_addr, %err, "API session ended");
        }
        state_for_reader.unregister_api_session(handle_for_reader.id);
        handle_for_reader.close();
    });

    handle.set_tasks(reader_handle, writer_handle);
}

async fn session_loop(
    state: &Arc<NodeState>,
    read_half: &mut ReadHalf<TcpStream>,
    handle: &Arc<ApiHandle>,
) -> Result<(), GossipError> {
    loop {
        let frame = wire::read_frame(read_half, wire::API_MIN_FRAME_SIZE).await?;
        handle_api_frame(state, handle, frame).await?;
    }
}

async fn handle_api_frame(state: &Arc<NodeState>, handle: &Arc<ApiHandle>, frame: Frame) -> Result<(), GossipError> {
    match frame.msg_type {
        wire::GOSSIP_ANNOUNCE => handle_gossip_announce(state, handle, frame.payload),
        wire::GOSSIP_NOTIFY => handle_gossip_notify(state, handle, frame.payload),
        wire::GOSSIP_VALIDATION => handle_gossip_validation(state, handle, frame.payload),
        other => Err(GossipError::UnknownType(other)),
    }
}

/// Locally originated announces are authoritative: no dedup, no
/// pending validation (spec §4.5, §9 Open Questions).
fn handle_gossip_announce(state: &Arc<NodeState>, handle: &Arc<ApiHandle>, payload: Bytes) -> Result<(), GossipError> {
    if payload.len() < 4 {
        return Err(GossipError::MalformedFrame("GOSSIP_ANNOUNCE payload too short"));
    }
    let ttl = payload[0];
    let data_type = u16::from_be_bytes([payload[2], payload[3]]);
    let data = payload.slice(4..);

    let notification = wire::encode_gossip_notification(0, data_type, &data);
    for subscriber in state.subscribers_snapshot(data_type) {
        if subscriber.id == handle.id {
            continue;
        }
        subscriber.send(wire::GOSSIP_NOTIFICATION, notification.clone());
    }

    let peer_announce = wire::encode_peer_announce(ttl, data_type, &data);
    for peer in state.verified_peers_snapshot() {
        peer.send(wire::PEER_ANNOUNCE, peer_announce.clone());
    }
    Ok(())
}

fn handle_gossip_notify(state: &Arc<NodeState>, handle: &Arc<ApiHandle>, mut payload: Bytes) -> Result<(), GossipError> {
    if payload.len() < 4 {
        return Err(GossipError::MalformedFrame("GOSSIP_NOTIFY payload too short"));
    }
    let _reserved = payload.get_u16();
    let data_type = payload.get_u16();
    state.subscribe(data_type, handle.id);
    Ok(())
}

fn handle_gossip_validation(state: &Arc<NodeState>, handle: &Arc<ApiHandle>, mut payload: Bytes) -> Result<(), GossipError> {
    if payload.len() < 4 {
        return Err(GossipError::MalformedFrame("GOSSIP_VALIDATION payload too short"));
    }
    let message_id = payload.get_u16();
    let flags = payload.get_u16();
    let valid = flags & 1 != 0;

    match state.apply_validation(message_id, handle.id, valid) {
        ValidationOutcome::Unknown => {
            debug!(message_id, "validation for unknown or already-resolved message_id, ignoring");
            Ok(())
        }
        ValidationOutcome::Unauthorized => Err(GossipError::UnauthorizedValidator),
        ValidationOutcome::Invalid(entry) => {
            if let Some(source) = entry.source.upgrade() {
                state.remove_peer_from_all(&source);
                source.close();
            }
            Ok(())
        }
        ValidationOutcome::StillPending => Ok(()),
        ValidationOutcome::Complete(entry) => {
            let payload = wire::encode_peer_announce(entry.ttl, entry.data_type, &entry.data);
            for peer in state.verified_peers_except(&entry.source) {
                peer.send(wire::PEER_ANNOUNCE, payload.clone());
            }
            Ok(())
        }
    }
}
