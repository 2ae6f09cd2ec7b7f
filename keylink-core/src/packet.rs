//! Packet codec: fixed little-endian layout per kind, tag in byte 0.
//!
//! ```text
//! Handshake       00 | version u8 | timestamp u32 | [latency f64]
//! HandshakeError  01
//! Exchange        02 | timestamp u32 | armored public key (UTF-8)
//! ExchangeError   03 | 00
//! Data            04 | timestamp u32 | armored ciphertext (UTF-8)
//! Error           05 | detail bytes
//! BinaryData      06 | timestamp u32 | raw ciphertext
//! ```
//!
//! One buffer holds exactly one packet; the length prefix lives in `wire`.

use std::fmt;

use crate::protocol::PacketKind;

const TIMESTAMP_SIZE: usize = 4;
const HANDSHAKE_SIZE: usize = 1 + 1 + TIMESTAMP_SIZE;
const HANDSHAKE_ACK_SIZE: usize = HANDSHAKE_SIZE + 8;
const STAMPED_HEADER_SIZE: usize = 1 + TIMESTAMP_SIZE;

/// A decoded packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Handshake {
        version: u8,
        timestamp: u32,
        /// Present only in the responder's acknowledgement.
        latency: Option<f64>,
    },
    HandshakeError,
    Exchange {
        timestamp: u32,
        public_key: String,
    },
    ExchangeError,
    Data {
        timestamp: u32,
        ciphertext: String,
    },
    Error {
        detail: Vec<u8>,
    },
    BinaryData {
        timestamp: u32,
        ciphertext: Vec<u8>,
    },
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Handshake { .. } => PacketKind::Handshake,
            Packet::HandshakeError => PacketKind::HandshakeError,
            Packet::Exchange { .. } => PacketKind::Exchange,
            Packet::ExchangeError => PacketKind::ExchangeError,
            Packet::Data { .. } => PacketKind::Data,
            Packet::Error { .. } => PacketKind::Error,
            Packet::BinaryData { .. } => PacketKind::BinaryData,
        }
    }

    /// Encode into a single buffer. Never fails.
    pub fn encode(&self) -> Vec<u8> {
        let tag = self.kind().tag();
        match self {
            Packet::Handshake {
                version,
                timestamp,
                latency,
            } => {
                let mut out = Vec::with_capacity(HANDSHAKE_ACK_SIZE);
                out.push(tag);
                out.push(*version);
                out.extend_from_slice(&timestamp.to_le_bytes());
                if let Some(latency) = latency {
                    out.extend_from_slice(&latency.to_le_bytes());
                }
                out
            }
            Packet::HandshakeError => vec![tag],
            Packet::ExchangeError => vec![tag, 0x00],
            Packet::Exchange {
                timestamp,
                public_key: text,
            }
            | Packet::Data {
                timestamp,
                ciphertext: text,
            } => stamped(tag, *timestamp, text.as_bytes()),
            Packet::BinaryData {
                timestamp,
                ciphertext,
            } => stamped(tag, *timestamp, ciphertext),
            Packet::Error { detail } => {
                let mut out = Vec::with_capacity(1 + detail.len());
                out.push(tag);
                out.extend_from_slice(detail);
                out
            }
        }
    }

    /// Decode one packet by position. Only the fixed-width fields and UTF-8 text are checked.
    pub fn decode(bytes: &[u8]) -> Result<Packet, PacketError> {
        let Some(&tag) = bytes.first() else {
            return Err(PacketError::Empty);
        };
        let kind = PacketKind::try_from(tag).map_err(|tag| PacketError::UnknownTag {
            tag,
            raw: bytes.to_vec(),
        })?;
        let truncated = || PacketError::Truncated {
            kind,
            raw: bytes.to_vec(),
        };
        let packet = match kind {
            PacketKind::Handshake => {
                if bytes.len() < HANDSHAKE_SIZE {
                    return Err(truncated());
                }
                let latency = if bytes.len() >= HANDSHAKE_ACK_SIZE {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&bytes[HANDSHAKE_SIZE..HANDSHAKE_ACK_SIZE]);
                    Some(f64::from_le_bytes(raw))
                } else {
                    None
                };
                Packet::Handshake {
                    version: bytes[1],
                    timestamp: read_u32(&bytes[2..HANDSHAKE_SIZE]),
                    latency,
                }
            }
            PacketKind::HandshakeError => Packet::HandshakeError,
            PacketKind::ExchangeError => Packet::ExchangeError,
            PacketKind::Error => Packet::Error {
                detail: bytes[1..].to_vec(),
            },
            PacketKind::Exchange | PacketKind::Data | PacketKind::BinaryData => {
                if bytes.len() < STAMPED_HEADER_SIZE {
                    return Err(truncated());
                }
                let timestamp = read_u32(&bytes[1..STAMPED_HEADER_SIZE]);
                let body = &bytes[STAMPED_HEADER_SIZE..];
                if kind == PacketKind::BinaryData {
                    Packet::BinaryData {
                        timestamp,
                        ciphertext: body.to_vec(),
                    }
                } else {
                    let text = String::from_utf8(body.to_vec()).map_err(|_| {
                        PacketError::InvalidText {
                            kind,
                            raw: bytes.to_vec(),
                        }
                    })?;
                    if kind == PacketKind::Exchange {
                        Packet::Exchange {
                            timestamp,
                            public_key: text,
                        }
                    } else {
                        Packet::Data {
                            timestamp,
                            ciphertext: text,
                        }
                    }
                }
            }
        };
        Ok(packet)
    }
}

fn stamped(tag: u8, timestamp: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(STAMPED_HEADER_SIZE + body.len());
    out.push(tag);
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Packet bytes rendered as `<Buffer 05 ff ...>` for diagnostics.
pub struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<Buffer")?;
        for byte in self.0 {
            write!(f, " {byte:02x}")?;
        }
        f.write_str(">")
    }
}

/// Error decoding a packet. Every variant keeps the offending bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("unknown packet tag {tag:#04x}, packet was {}", HexDump(raw))]
    UnknownTag { tag: u8, raw: Vec<u8> },
    #[error("truncated {kind:?} packet {}", HexDump(raw))]
    Truncated { kind: PacketKind, raw: Vec<u8> },
    #[error("{kind:?} payload is not UTF-8: {}", HexDump(raw))]
    InvalidText { kind: PacketKind, raw: Vec<u8> },
}

impl PacketError {
    /// Raw bytes of the rejected packet.
    pub fn raw(&self) -> &[u8] {
        match self {
            PacketError::Empty => &[],
            PacketError::UnknownTag { raw, .. }
            | PacketError::Truncated { raw, .. }
            | PacketError::InvalidText { raw, .. } => raw,
        }
    }
}
