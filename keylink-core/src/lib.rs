//! keylink protocol reference implementation.
//! Host-driven: no I/O; host passes received packets in and receives actions.

pub mod crypto;
pub mod engine;
pub mod error;
pub mod identity;
pub mod packet;
pub mod protocol;
pub mod registry;
pub mod trust;
pub mod wire;

pub use crypto::{Cipher, CryptoError, SealedBox, UnlockedKey};
pub use engine::{seal_binary, seal_text, Action, Engine, Event, Message, Payload, PeerKey, Role, State};
pub use error::ProtocolError;
pub use identity::{KeyPair, Settings};
pub use packet::{Packet, PacketError};
pub use protocol::{PacketKind, PROTOCOL_VERSION};
pub use registry::{ConnectionId, ConnectionSet};
pub use trust::{TrustDecision, TrustPolicy};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
