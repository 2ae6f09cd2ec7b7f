//! Handle to a key-exchanged peer: encrypts to its public key and queues packets for the writer task.

use std::fmt;
use std::sync::Arc;

use keylink_core::{
    encode_frame, seal_binary, seal_text, Cipher, ConnectionId, CryptoError, FrameEncodeError,
    PeerKey,
};
use tokio::sync::{mpsc, Notify};

use crate::transport::Outbound;

#[derive(Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    peer: PeerKey,
    cipher: Arc<dyn Cipher>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closer: Arc<Notify>,
}

impl PeerHandle {
    pub(crate) fn new(
        id: ConnectionId,
        peer: PeerKey,
        cipher: Arc<dyn Cipher>,
        outbound: mpsc::UnboundedSender<Outbound>,
        closer: Arc<Notify>,
    ) -> Self {
        Self {
            id,
            peer,
            cipher,
            outbound,
            closer,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn public_key(&self) -> &str {
        &self.peer.public_key
    }

    pub fn fingerprint(&self) -> &str {
        &self.peer.fingerprint
    }

    /// Encrypt `text` to the peer and queue it. Returns the armored ciphertext that was sent.
    pub fn send_data(&self, text: &str) -> Result<String, SendError> {
        let (packet, armored) = seal_text(self.cipher.as_ref(), &self.peer.public_key, text)?;
        self.send_packet(&packet)?;
        Ok(armored)
    }

    /// Encrypt `bytes` to the peer and queue it as a binary packet. Returns the raw ciphertext.
    pub fn send_binary_data(&self, bytes: &[u8]) -> Result<Vec<u8>, SendError> {
        let (packet, sealed) = seal_binary(self.cipher.as_ref(), &self.peer.public_key, bytes)?;
        self.send_packet(&packet)?;
        Ok(sealed)
    }

    /// Close the underlying transport.
    pub fn close(&self) {
        self.closer.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    fn send_packet(&self, packet: &[u8]) -> Result<(), SendError> {
        let frame = encode_frame(packet)?;
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| SendError::Closed)
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("fingerprint", &self.peer.fingerprint)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("encryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Frame(#[from] FrameEncodeError),
    #[error("connection closed")]
    Closed,
}
