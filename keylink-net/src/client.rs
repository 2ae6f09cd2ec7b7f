//! Initiator: opens one TCP connection and drives the handshake from its side.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use keylink_core::{Cipher, ConnectionId, Engine, KeyPair, SealedBox, Settings};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::Config;
use crate::event::{ServerEvent, SessionEvent};
use crate::gate::{self, TrustSlot};
use crate::session::{self, SessionContext};

#[derive(Clone)]
pub struct Client {
    key_pair: Arc<KeyPair>,
    trusted_fingerprints: Option<Vec<String>>,
    cipher: Arc<dyn Cipher>,
    trust: TrustSlot,
    handshake_timeout: Option<Duration>,
}

impl Client {
    pub fn new(settings: Settings) -> Self {
        Self {
            key_pair: Arc::new(settings.key_pair),
            trusted_fingerprints: settings.trusted_fingerprints,
            cipher: Arc::new(SealedBox),
            trust: TrustSlot::default(),
            handshake_timeout: None,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut client = Self::new(config.settings()?);
        client.handshake_timeout = config.handshake_timeout();
        Ok(client)
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Install the trust predicate for connections opened from now on.
    /// Ignored while a pinned fingerprint list is configured.
    pub fn should_trust<F, Fut>(&self, predicate: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.trust.set(predicate);
    }

    /// Open a connection and start the handshake. Setup progress arrives as session events.
    pub async fn connect<A: ToSocketAddrs>(&self, addr: A) -> io::Result<ClientSession> {
        let stream = TcpStream::connect(addr).await?;
        let peer_addr = stream.peer_addr()?;
        let id = ConnectionId::new();
        debug!(connection = %id, %peer_addr, "connected");

        let predicate = self.trust.get();
        let policy = gate::policy(self.trusted_fingerprints.as_deref(), &predicate);
        let engine = Engine::initiator(self.key_pair.clone(), self.cipher.clone(), policy);
        let (tx, rx) = mpsc::unbounded_channel();
        let closer = Arc::new(Notify::new());
        let ctx = SessionContext {
            id,
            cipher: self.cipher.clone(),
            trust: predicate,
            registry: None,
            events: tx,
            handshake_timeout: self.handshake_timeout,
        };
        let task = tokio::spawn(session::run(engine, stream, ctx, closer.clone()));
        Ok(ClientSession {
            id,
            peer_addr,
            events: rx,
            closer,
            task: Some(task),
        })
    }
}

/// One outbound connection. Dropping it closes the transport.
pub struct ClientSession {
    id: ConnectionId,
    peer_addr: SocketAddr,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    closer: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl ClientSession {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Next event, or `None` once the session has ended and every event was read.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await.map(|tagged| tagged.event)
    }

    pub fn close(&self) {
        self.closer.notify_one();
    }

    /// Wait until the session task has finished.
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.closer.notify_one();
    }
}
