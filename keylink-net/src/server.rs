//! Responder: accepts TCP connections, runs one session per stream, tracks key-exchanged peers.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use keylink_core::{Cipher, ConnectionId, ConnectionSet, Engine, KeyPair, SealedBox, Settings};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::event::ServerEvent;
use crate::gate::{self, TrustSlot};
use crate::peer::{PeerHandle, SendError};
use crate::session::{self, Registry, SessionContext};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct Server {
    key_pair: Arc<KeyPair>,
    trusted_fingerprints: Option<Vec<String>>,
    cipher: Arc<dyn Cipher>,
    trust: TrustSlot,
    handshake_timeout: Option<Duration>,
    connections: Registry,
}

impl Server {
    pub fn new(settings: Settings) -> Self {
        Self {
            key_pair: Arc::new(settings.key_pair),
            trusted_fingerprints: settings.trusted_fingerprints,
            cipher: Arc::new(SealedBox),
            trust: TrustSlot::default(),
            handshake_timeout: None,
            connections: Arc::new(Mutex::new(ConnectionSet::new())),
        }
    }

    /// Build from a loaded config (key files, pinned fingerprints, timeout).
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut server = Self::new(config.settings()?);
        server.handshake_timeout = config.handshake_timeout();
        Ok(server)
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Fail connections that are not established within `timeout`.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Install the trust predicate used for connections accepted from now on.
    /// Ignored while a pinned fingerprint list is configured.
    pub fn should_trust<F, Fut>(&self, predicate: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.trust.set(predicate);
    }

    /// Bind and start accepting. Events from every connection arrive on the returned listener.
    pub async fn listen<A: ToSocketAddrs>(&self, addr: A) -> io::Result<Listener> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening");
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Arc::new(listener);
        let accept = move || {
            let listener = listener.clone();
            async move { listener.accept().await }
        };
        let task = tokio::spawn(self.clone().accept_loop(accept, tx));
        Ok(Listener {
            local_addr,
            events: rx,
            connections: self.connections.clone(),
            task,
        })
    }

    /// Spawn a session per accepted stream. Accept errors (descriptor exhaustion, aborted
    /// handshakes) are logged and retried after a pause.
    async fn accept_loop<A, F>(self, mut accept: A, events: mpsc::UnboundedSender<ServerEvent>)
    where
        A: FnMut() -> F,
        F: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
    {
        loop {
            match accept().await {
                Ok((stream, remote)) => {
                    let id = ConnectionId::new();
                    debug!(connection = %id, %remote, "accepted");
                    let predicate = self.trust.get();
                    let policy = gate::policy(self.trusted_fingerprints.as_deref(), &predicate);
                    let engine = Engine::responder(self.key_pair.clone(), self.cipher.clone(), policy);
                    let ctx = SessionContext {
                        id,
                        cipher: self.cipher.clone(),
                        trust: predicate,
                        registry: Some(self.connections.clone()),
                        events: events.clone(),
                        handshake_timeout: self.handshake_timeout,
                    };
                    tokio::spawn(session::run(engine, stream, ctx, Arc::new(Notify::new())));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed, retrying");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Key-exchanged peers at this moment.
    pub async fn connections(&self) -> Vec<PeerHandle> {
        let snapshot = self.connections.lock().await.snapshot();
        snapshot.into_iter().map(|(_, peer)| peer).collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Encrypt `text` separately to every connected peer.
    pub async fn broadcast(&self, text: &str) -> BroadcastReport {
        self.fan_out(|peer| peer.send_data(text).map(drop)).await
    }

    pub async fn broadcast_binary(&self, bytes: &[u8]) -> BroadcastReport {
        self.fan_out(|peer| peer.send_binary_data(bytes).map(drop)).await
    }

    async fn fan_out<F>(&self, send: F) -> BroadcastReport
    where
        F: Fn(&PeerHandle) -> Result<(), SendError>,
    {
        let peers = self.connections.lock().await.snapshot();
        let mut report = BroadcastReport::default();
        for (id, peer) in peers {
            match send(&peer) {
                Ok(()) => report.delivered.push(id),
                Err(e) => {
                    warn!(connection = %id, error = %e, "broadcast to peer failed");
                    report.failed.push((id, e));
                }
            }
        }
        report
    }
}

/// Per-recipient outcome of a broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<ConnectionId>,
    pub failed: Vec<(ConnectionId, SendError)>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A bound server. Dropping it stops accepting; established sessions keep running.
pub struct Listener {
    local_addr: SocketAddr,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    connections: Registry,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Stop accepting and close every key-exchanged connection.
    pub async fn shutdown(&self) {
        self.task.abort();
        let peers = self.connections.lock().await.snapshot();
        for (_, peer) in peers {
            peer.close();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::event::SessionEvent;

    #[tokio::test]
    async fn accept_error_does_not_stop_listener() {
        let server = Server::new(Settings::new(SealedBox::generate(None).unwrap()));
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();
        let mut failures = 1;
        let accept = move || {
            let fail = failures > 0;
            failures -= usize::from(fail);
            let listener = listener.clone();
            async move {
                if fail {
                    return Err(io::Error::new(io::ErrorKind::Other, "too many open files"));
                }
                listener.accept().await
            }
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(server.clone().accept_loop(accept, tx));

        let client = Client::new(Settings::new(SealedBox::generate(None).unwrap()));
        let _session = client.connect(addr).await.unwrap();
        let tagged = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(tagged.event, SessionEvent::Connection(_)));
        assert_eq!(server.connection_count().await, 1);
        task.abort();
    }
}
