//! Frame codec (spec §4.1, §6): `size:u16-be || type:u16-be || payload`,
//! where `size` includes the 4-byte header.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::GossipError;

pub const HEADER_LEN: u16 = 4;
pub const MAX_FRAME_SIZE: u16 = u16::MAX;

pub const GOSSIP_ANNOUNCE: u16 = 500;
pub const GOSSIP_NOTIFY: u16 = 501;
pub const GOSSIP_NOTIFICATION: u16 = 502;
pub const GOSSIP_VALIDATION: u16 = 503;

pub const PEER_INIT: u16 = 540;
pub const PEER_VERIFY: u16 = 541;
pub const PEER_OK: u16 = 542;
pub const PEER_ANNOUNCE: u16 = 543;
pub const PEER_DISCOVER: u16 = 544;
pub const PEER_BROADCAST: u16 = 545;

/// Minimum total frame size accepted on the API port (§4.1).
pub const API_MIN_FRAME_SIZE: u16 = 8;
/// Minimum total frame size accepted on the peer port (§4.1).
pub const PEER_MIN_FRAME_SIZE: u16 = 4;

#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: u16,
    pub payload: Bytes,
}

/// Reads one frame off `stream`, enforcing `min_size` (§4.1: 4 for peer
/// connections, 8 for API connections). A short read before the frame
/// completes is treated as a fatal I/O error — there is no
/// resynchronization (spec §4.1, §7).
pub async fn read_frame(
    stream: &mut (impl AsyncRead + Unpin),
    min_size: u16,
) -> Result<Frame, GossipError> {
    let mut size_buf = [0u8; 2];
    stream.read_exact(&mut size_buf).await?;
    let size = u16::from_be_bytes(size_buf);
    if size < min_size {
        return Err(GossipError::MalformedFrame("frame shorter than header"));
    }

    let mut rest = vec![0u8; (size - 2) as usize];
    stream.read_exact(&mut rest).await?;

    let msg_type = u16::from_be_bytes([rest[0], rest[1]]);
    let payload = Bytes::copy_from_slice(&rest[2..]);
    Ok(Frame { msg_type, payload })
}

/// Writes one frame: a single `write_all` followed by a single `flush`
/// (spec §4.1 write path).
pub async fn write_frame(
    stream: &mut (impl AsyncWrite + Unpin),
    msg_type: u16,
    payload: &[u8],
) -> Result<(), GossipError> {
    let total = HEADER_LEN as usize + payload.len();
    if total > MAX_FRAME_SIZE as usize {
        return Err(GossipError::MalformedFrame("payload too large to frame"));
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u16(total as u16);
    buf.put_u16(msg_type);
    buf.extend_from_slice(payload);

    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

pub fn encode_gossip_notification(message_id: u16, data_type: u16, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u16(message_id);
    buf.put_u16(data_type);
    buf.extend_from_slice(data);
    buf.freeze()
}

pub fn encode_peer_announce(ttl: u8, data_type: u16, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u8(ttl);
    buf.put_u8(0); // reserved
    buf.put_u16(data_type);
    buf.extend_from_slice(data);
    buf.freeze()
}
