//! keylink wire protocol: packet tags and version.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current protocol version. Sent in every handshake; peers must match exactly.
pub const PROTOCOL_VERSION: u8 = 1;

/// Leading tag byte of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Version + timestamp; the responder's ack also carries measured latency.
    Handshake = 0x00,
    HandshakeError = 0x01,
    /// Timestamp + armored public key.
    Exchange = 0x02,
    /// Trust gate rejected the peer's key.
    ExchangeError = 0x03,
    /// Timestamp + armored ciphertext (text mode).
    Data = 0x04,
    Error = 0x05,
    /// Timestamp + raw ciphertext (binary mode).
    BinaryData = 0x06,
}

impl PacketKind {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, u8> {
        Ok(match tag {
            0x00 => PacketKind::Handshake,
            0x01 => PacketKind::HandshakeError,
            0x02 => PacketKind::Exchange,
            0x03 => PacketKind::ExchangeError,
            0x04 => PacketKind::Data,
            0x05 => PacketKind::Error,
            0x06 => PacketKind::BinaryData,
            other => return Err(other),
        })
    }
}

/// Unix time in whole seconds, truncated into the 32-bit wire slot.
pub fn unix_time32() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Unix time in fractional seconds. Used for latency against a 32-bit peer timestamp.
pub fn unix_time_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
