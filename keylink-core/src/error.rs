//! Protocol-level failures. Each is reported as an event; none tears down the connection by itself.

use crate::crypto::CryptoError;
use crate::engine::State;
use crate::packet::{HexDump, PacketError};
use crate::protocol::PacketKind;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol version mismatch: expected {expected}, received {received}")]
    VersionMismatch { expected: u8, received: u8 },
    #[error("peer {fingerprint} is not trusted")]
    UntrustedPeer { fingerprint: String },
    #[error("invalid packet: {0}")]
    InvalidPacket(#[from] PacketError),
    #[error("unexpected {kind:?} packet while {state:?}: {}", HexDump(raw))]
    UnexpectedPacket {
        kind: PacketKind,
        state: State,
        raw: Vec<u8>,
    },
    #[error("peer key unusable: {0}")]
    PeerKey(CryptoError),
    #[error("decryption failed: {0}")]
    Decryption(CryptoError),
    #[error("peer rejected our key")]
    PeerRejected,
    #[error("peer reported {kind:?}: {}", HexDump(detail))]
    PeerReported { kind: PacketKind, detail: Vec<u8> },
    #[error("timed out waiting for handshake")]
    HandshakeTimeout,
    #[error("timed out waiting for key exchange")]
    ExchangeTimeout,
}

impl ProtocolError {
    /// Raw packet bytes carried by the error, when there are any.
    pub fn raw(&self) -> Option<&[u8]> {
        match self {
            ProtocolError::InvalidPacket(e) => Some(e.raw()),
            ProtocolError::UnexpectedPacket { raw, .. } => Some(raw),
            ProtocolError::PeerReported { detail, .. } => Some(detail),
            _ => None,
        }
    }
}
