//! Per-connection session pump: read a frame, run the engine, apply its actions, repeat.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use keylink_core::{encode_frame, Action, Cipher, ConnectionId, ConnectionSet, Engine, Event};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::event::{ServerEvent, SessionError, SessionEvent};
use crate::gate::TrustPredicate;
use crate::peer::PeerHandle;
use crate::transport::{read_packet, spawn_writer, Outbound};

/// How long queued frames may take to reach the socket after the session ends.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Responder-side set of key-exchanged peers.
pub(crate) type Registry = Arc<Mutex<ConnectionSet<PeerHandle>>>;

pub(crate) struct SessionContext {
    pub id: ConnectionId,
    pub cipher: Arc<dyn Cipher>,
    pub trust: Option<TrustPredicate>,
    pub registry: Option<Registry>,
    pub events: mpsc::UnboundedSender<ServerEvent>,
    pub handshake_timeout: Option<Duration>,
}

/// Why the pump stopped.
enum Stop {
    Requested,
    Deadline,
    PeerClosed,
    Transport(SessionError),
}

struct Session {
    engine: Engine,
    ctx: SessionContext,
    outbound: mpsc::UnboundedSender<Outbound>,
    closer: Arc<Notify>,
    deadline: Option<Instant>,
    registered: bool,
}

/// Drive one connection until the peer closes, the transport fails, or a close is requested.
/// Every action of one packet, trust predicate included, completes before the next frame is read.
pub(crate) async fn run(
    engine: Engine,
    stream: TcpStream,
    ctx: SessionContext,
    closer: Arc<Notify>,
) {
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = spawn_writer(writer, rx);
    let deadline = ctx.handshake_timeout.map(|d| Instant::now() + d);
    let mut session = Session {
        engine,
        ctx,
        outbound: tx,
        closer,
        deadline,
        registered: false,
    };

    let actions = session.engine.start();
    let stop = match session.apply(actions).await {
        Some(stop) => stop,
        None => loop {
            let closer = session.closer.clone();
            tokio::select! {
                _ = closer.notified() => break Stop::Requested,
                _ = expire(session.setup_deadline()) => break Stop::Deadline,
                read = read_packet(&mut reader) => match read {
                    Ok(Some(packet)) => {
                        let actions = session.engine.on_packet(&packet);
                        if let Some(stop) = session.apply(actions).await {
                            break stop;
                        }
                    }
                    Ok(None) => break Stop::PeerClosed,
                    Err(e) => break Stop::Transport(e),
                }
            }
        },
    };
    session.report(stop);

    session.unregister().await;
    let _ = session.outbound.send(Outbound::Shutdown);
    let abort = writer_task.abort_handle();
    if tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await.is_err() {
        warn!(connection = %session.ctx.id, "outbound frames not drained in time");
        abort.abort();
    }
    let actions = session.engine.on_close();
    session.apply(actions).await;
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Session {
    /// Deadline that still applies: only while the connection is being set up.
    fn setup_deadline(&self) -> Option<Instant> {
        self.deadline
            .filter(|_| self.engine.timeout_error().is_some())
    }

    fn report(&self, stop: Stop) {
        match stop {
            Stop::Requested => debug!(connection = %self.ctx.id, "close requested"),
            Stop::PeerClosed => debug!(connection = %self.ctx.id, "peer closed"),
            Stop::Deadline => {
                if let Some(error) = self.engine.timeout_error() {
                    warn!(connection = %self.ctx.id, %error, "connection setup timed out");
                    self.publish(SessionEvent::Error(error.into()));
                }
            }
            Stop::Transport(e) => {
                warn!(connection = %self.ctx.id, error = %e, "transport failed");
                self.publish(SessionEvent::Error(e));
            }
        }
    }

    /// Perform actions in order. A close request or the setup deadline may interrupt
    /// a pending trust predicate; the trust decision is then never applied.
    async fn apply(&mut self, actions: Vec<Action>) -> Option<Stop> {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send(packet) => self.send(&packet),
                Action::CheckTrust(fingerprint) => {
                    let trusted = match self.ctx.trust.clone() {
                        Some(predicate) => {
                            let closer = self.closer.clone();
                            tokio::select! {
                                trusted = predicate(fingerprint) => trusted,
                                _ = closer.notified() => return Some(Stop::Requested),
                                _ = expire(self.setup_deadline()) => return Some(Stop::Deadline),
                            }
                        }
                        None => true,
                    };
                    let follow_up = self.engine.resolve_trust(trusted);
                    for action in follow_up.into_iter().rev() {
                        queue.push_front(action);
                    }
                }
                Action::Emit(event) => self.emit(event).await,
            }
        }
        None
    }

    fn send(&self, packet: &[u8]) {
        match encode_frame(packet) {
            Ok(frame) => {
                let _ = self.outbound.send(Outbound::Frame(frame));
            }
            Err(e) => warn!(connection = %self.ctx.id, error = %e, "dropping outbound packet"),
        }
    }

    async fn emit(&mut self, event: Event) {
        match event {
            Event::Established(peer) => {
                let handle = PeerHandle::new(
                    self.ctx.id,
                    peer,
                    self.ctx.cipher.clone(),
                    self.outbound.clone(),
                    self.closer.clone(),
                );
                if let Some(registry) = &self.ctx.registry {
                    registry.lock().await.insert(self.ctx.id, handle.clone());
                    self.registered = true;
                }
                info!(connection = %self.ctx.id, fingerprint = handle.fingerprint(), "peer connected");
                self.publish(SessionEvent::Connection(handle));
            }
            Event::Message(message) => self.publish(SessionEvent::Message(message)),
            Event::Failed(error) => {
                if !self.engine.is_established() {
                    self.unregister().await;
                }
                self.publish(SessionEvent::Error(SessionError::Protocol(error)));
            }
            Event::Closed => self.publish(SessionEvent::Close),
        }
    }

    async fn unregister(&mut self) {
        if !self.registered {
            return;
        }
        if let Some(registry) = &self.ctx.registry {
            registry.lock().await.remove(&self.ctx.id);
        }
        self.registered = false;
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.ctx.events.send(ServerEvent {
            connection: self.ctx.id,
            event,
        });
    }
}
