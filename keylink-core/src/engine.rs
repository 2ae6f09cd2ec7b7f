//! Protocol engine: the per-connection state machine shared by both roles.
//! Host-driven: no I/O; host passes received packets in and performs the returned actions.
//!
//! `AwaitingHandshake -> AwaitingExchange -> Established`, with `Rejected` once a trust
//! check fails on either side and `Closed` once the transport is gone.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::crypto::{self, Cipher, CryptoError, UnlockedKey};
use crate::error::ProtocolError;
use crate::identity::KeyPair;
use crate::packet::Packet;
use crate::protocol::{unix_time32, unix_time_f64, PacketKind, PROTOCOL_VERSION};
use crate::trust::{TrustDecision, TrustPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the transport; drives the handshake.
    Initiator,
    /// Accepted the transport; answers.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingHandshake,
    AwaitingExchange,
    Established,
    Rejected,
    Closed,
}

/// The peer's key as received at exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerKey {
    pub public_key: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

/// A decrypted data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sender's clock when the packet was built (Unix seconds, truncated to 32 bits).
    pub timestamp: u32,
    pub payload: Payload,
}

/// Something the host should surface to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Established(PeerKey),
    Message(Message),
    Failed(ProtocolError),
    Closed,
}

/// Action for host to perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write one encoded packet to the transport.
    Send(Vec<u8>),
    Emit(Event),
    /// Run the trust predicate on this fingerprint, then call [`Engine::resolve_trust`].
    CheckTrust(String),
}

pub struct Engine {
    role: Role,
    state: State,
    key_pair: Arc<KeyPair>,
    cipher: Arc<dyn Cipher>,
    trust: TrustPolicy,
    /// Initiator only: built at start, sent once the handshake ack arrives.
    held_exchange: Option<Vec<u8>>,
    /// Peer awaiting a deferred trust decision.
    pending_peer: Option<PeerKey>,
    peer: Option<PeerKey>,
    latency: Option<f64>,
    /// Own private key, unlocked on the first data packet.
    unlocked: Option<UnlockedKey>,
}

impl Engine {
    pub fn new(
        role: Role,
        key_pair: Arc<KeyPair>,
        cipher: Arc<dyn Cipher>,
        trust: TrustPolicy,
    ) -> Self {
        Self {
            role,
            state: State::AwaitingHandshake,
            key_pair,
            cipher,
            trust,
            held_exchange: None,
            pending_peer: None,
            peer: None,
            latency: None,
            unlocked: None,
        }
    }

    pub fn initiator(key_pair: Arc<KeyPair>, cipher: Arc<dyn Cipher>, trust: TrustPolicy) -> Self {
        Self::new(Role::Initiator, key_pair, cipher, trust)
    }

    pub fn responder(key_pair: Arc<KeyPair>, cipher: Arc<dyn Cipher>, trust: TrustPolicy) -> Self {
        Self::new(Role::Responder, key_pair, cipher, trust)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    /// Peer key once the exchange has been accepted.
    pub fn peer(&self) -> Option<&PeerKey> {
        self.peer.as_ref()
    }

    /// Round-trip latency in seconds: measured by the responder, reported to the initiator in the ack.
    pub fn latency(&self) -> Option<f64> {
        self.latency
    }

    /// Call once the transport is open. The initiator sends its handshake and holds its exchange.
    pub fn start(&mut self) -> Vec<Action> {
        if self.role != Role::Initiator
            || self.state != State::AwaitingHandshake
            || self.held_exchange.is_some()
        {
            return vec![];
        }
        let hello = Packet::Handshake {
            version: PROTOCOL_VERSION,
            timestamp: unix_time32(),
            latency: None,
        };
        self.held_exchange = Some(self.exchange_packet());
        debug!("sending handshake");
        vec![Action::Send(hello.encode())]
    }

    /// Process exactly one received packet.
    pub fn on_packet(&mut self, bytes: &[u8]) -> Vec<Action> {
        if self.state == State::Closed {
            return vec![];
        }
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "dropping invalid packet");
                return vec![failed(e.into())];
            }
        };
        let kind = packet.kind();
        debug!(role = ?self.role, state = ?self.state, ?kind, "packet received");
        if self.pending_peer.is_some() {
            return vec![self.unexpected(kind, bytes)];
        }

        match (packet, self.state) {
            (
                Packet::Handshake {
                    version,
                    timestamp,
                    latency,
                },
                State::AwaitingHandshake,
            ) => self.on_handshake(version, timestamp, latency),
            (Packet::Exchange { public_key, .. }, State::AwaitingExchange) => {
                self.on_exchange(public_key)
            }
            (
                Packet::Data {
                    timestamp,
                    ciphertext,
                },
                State::Established,
            ) => vec![self.open_text(timestamp, &ciphertext)],
            (
                Packet::BinaryData {
                    timestamp,
                    ciphertext,
                },
                State::Established,
            ) => vec![self.open_binary(timestamp, &ciphertext)],
            (Packet::ExchangeError, State::AwaitingExchange | State::Established) => {
                warn!(role = ?self.role, "peer rejected our key");
                self.state = State::Rejected;
                self.peer = None;
                vec![failed(ProtocolError::PeerRejected)]
            }
            (Packet::HandshakeError, _) => vec![failed(ProtocolError::PeerReported {
                kind: PacketKind::HandshakeError,
                detail: Vec::new(),
            })],
            (Packet::Error { detail }, _) => vec![failed(ProtocolError::PeerReported {
                kind: PacketKind::Error,
                detail,
            })],
            _ => vec![self.unexpected(kind, bytes)],
        }
    }

    /// Answer a [`Action::CheckTrust`]. `true` means the peer is trusted.
    pub fn resolve_trust(&mut self, trusted: bool) -> Vec<Action> {
        let Some(peer) = self.pending_peer.take() else {
            return vec![];
        };
        if self.state == State::Closed {
            return vec![];
        }
        if trusted {
            self.accept(peer)
        } else {
            self.reject(peer)
        }
    }

    /// Transport closed. Emits `Closed` once; every later call is a no-op.
    pub fn on_close(&mut self) -> Vec<Action> {
        if self.state == State::Closed {
            return vec![];
        }
        info!(role = ?self.role, state = ?self.state, "connection closed");
        self.state = State::Closed;
        self.pending_peer = None;
        self.held_exchange = None;
        vec![Action::Emit(Event::Closed)]
    }

    /// Failure to report when a setup deadline expires in the current state.
    pub fn timeout_error(&self) -> Option<ProtocolError> {
        match self.state {
            State::AwaitingHandshake => Some(ProtocolError::HandshakeTimeout),
            State::AwaitingExchange => Some(ProtocolError::ExchangeTimeout),
            _ => None,
        }
    }

    fn on_handshake(&mut self, version: u8, timestamp: u32, latency: Option<f64>) -> Vec<Action> {
        if version != PROTOCOL_VERSION {
            warn!(version, "handshake version mismatch");
            return vec![failed(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                received: version,
            })];
        }
        self.state = State::AwaitingExchange;
        match self.role {
            Role::Responder => {
                let measured = unix_time_f64() - f64::from(timestamp);
                self.latency = Some(measured);
                let ack = Packet::Handshake {
                    version: PROTOCOL_VERSION,
                    timestamp: unix_time32(),
                    latency: Some(measured),
                };
                vec![Action::Send(ack.encode())]
            }
            Role::Initiator => {
                self.latency = latency;
                let exchange = match self.held_exchange.take() {
                    Some(exchange) => exchange,
                    None => self.exchange_packet(),
                };
                vec![Action::Send(exchange)]
            }
        }
    }

    fn on_exchange(&mut self, public_key: String) -> Vec<Action> {
        let fingerprint = match self.cipher.fingerprint(&public_key) {
            Ok(fp) => fp,
            Err(e) => {
                warn!(error = %e, "peer sent an unusable key");
                return vec![failed(ProtocolError::PeerKey(e))];
            }
        };
        let peer = PeerKey {
            public_key,
            fingerprint,
        };
        match self.trust.evaluate(&peer.fingerprint) {
            TrustDecision::Trusted => self.accept(peer),
            TrustDecision::Untrusted => self.reject(peer),
            TrustDecision::Deferred => {
                let fingerprint = peer.fingerprint.clone();
                self.pending_peer = Some(peer);
                vec![Action::CheckTrust(fingerprint)]
            }
        }
    }

    fn accept(&mut self, peer: PeerKey) -> Vec<Action> {
        let mut actions = Vec::with_capacity(2);
        if self.role == Role::Responder {
            actions.push(Action::Send(self.exchange_packet()));
        }
        info!(role = ?self.role, fingerprint = %peer.fingerprint, "key exchange complete");
        self.state = State::Established;
        self.peer = Some(peer.clone());
        actions.push(Action::Emit(Event::Established(peer)));
        actions
    }

    // Exactly one ExchangeError; locally the rejection is only logged.
    fn reject(&mut self, peer: PeerKey) -> Vec<Action> {
        let reason = ProtocolError::UntrustedPeer {
            fingerprint: peer.fingerprint,
        };
        warn!(role = ?self.role, error = %reason, "rejecting key exchange");
        self.state = State::Rejected;
        vec![Action::Send(Packet::ExchangeError.encode())]
    }

    fn exchange_packet(&self) -> Vec<u8> {
        Packet::Exchange {
            timestamp: unix_time32(),
            public_key: self.key_pair.public_key.clone(),
        }
        .encode()
    }

    fn open_text(&mut self, timestamp: u32, armored: &str) -> Action {
        let result = crypto::dearmor_message(armored)
            .and_then(|sealed| self.decrypt(&sealed))
            .and_then(|plain| String::from_utf8(plain).map_err(|_| CryptoError::Decrypt));
        self.deliver(timestamp, result.map(Payload::Text))
    }

    fn open_binary(&mut self, timestamp: u32, sealed: &[u8]) -> Action {
        let result = self.decrypt(sealed).map(Payload::Binary);
        self.deliver(timestamp, result)
    }

    fn decrypt(&mut self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = match self.unlocked.take() {
            Some(key) => key,
            None => self
                .cipher
                .unlock(&self.key_pair.private_key, self.key_pair.passphrase.as_deref())?,
        };
        let result = self
            .cipher
            .decrypt(&key.private_key, key.passphrase.as_deref(), sealed);
        self.unlocked = Some(key);
        result
    }

    fn deliver(&self, timestamp: u32, result: Result<Payload, CryptoError>) -> Action {
        match result {
            Ok(payload) => Action::Emit(Event::Message(Message { timestamp, payload })),
            Err(e) => {
                warn!(error = %e, "failed to decrypt data packet");
                failed(ProtocolError::Decryption(e))
            }
        }
    }

    fn unexpected(&self, kind: PacketKind, bytes: &[u8]) -> Action {
        warn!(role = ?self.role, state = ?self.state, ?kind, "unexpected packet");
        failed(ProtocolError::UnexpectedPacket {
            kind,
            state: self.state,
            raw: bytes.to_vec(),
        })
    }
}

fn failed(error: ProtocolError) -> Action {
    Action::Emit(Event::Failed(error))
}

/// Build a text-mode Data packet for `public_key`. Returns the packet and the armored ciphertext.
pub fn seal_text(
    cipher: &dyn Cipher,
    public_key: &str,
    text: &str,
) -> Result<(Vec<u8>, String), CryptoError> {
    let armored = crypto::armor_message(&cipher.encrypt(public_key, text.as_bytes())?);
    let packet = Packet::Data {
        timestamp: unix_time32(),
        ciphertext: armored.clone(),
    }
    .encode();
    Ok((packet, armored))
}

/// Build a BinaryData packet for `public_key`. Returns the packet and the raw ciphertext.
pub fn seal_binary(
    cipher: &dyn Cipher,
    public_key: &str,
    bytes: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let sealed = cipher.encrypt(public_key, bytes)?;
    let packet = Packet::BinaryData {
        timestamp: unix_time32(),
        ciphertext: sealed.clone(),
    }
    .encode();
    Ok((packet, sealed))
}
