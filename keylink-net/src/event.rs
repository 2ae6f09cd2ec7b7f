//! Events published by a connection to the application.

use keylink_core::{ConnectionId, FrameDecodeError, Message, ProtocolError};

use crate::peer::PeerHandle;

#[derive(Debug)]
pub enum SessionEvent {
    /// Key exchange accepted; the handle can send to the peer.
    Connection(PeerHandle),
    Message(Message),
    /// Packet-level failures leave the connection open; transport failures are followed by `Close`.
    Error(SessionError),
    Close,
}

/// A session event tagged with the connection it came from.
#[derive(Debug)]
pub struct ServerEvent {
    pub connection: ConnectionId,
    pub event: SessionEvent,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("framing error: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn as_protocol(&self) -> Option<&ProtocolError> {
        match self {
            SessionError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}
