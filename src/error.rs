//! Error kinds for the session layer (spec §7).
//!
//! Every variant here is session-fatal: whoever receives it logs the
//! session down and tears it out of every registry it's in. None of
//! these are retried.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("message type {0:#06x} is not valid for the current session state")]
    UnexpectedForState(u16),

    #[error("handshake timed out before PEER_VERIFY arrived")]
    HandshakeTimeout,

    #[error("proof of work does not meet required difficulty")]
    WeakProofOfWork,

    #[error("validation received from a session that is not an awaited validator")]
    UnauthorizedValidator,

    #[error("unknown message type {0:#06x}")]
    UnknownType(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
