//! keylink over TCP: tokio host for the protocol engine.
//! `Client` opens connections, `Server` accepts them and tracks key-exchanged peers for broadcast.

pub mod client;
pub mod config;
pub mod event;
mod gate;
pub mod peer;
pub mod server;
mod session;
mod transport;

pub use client::{Client, ClientSession};
pub use config::Config;
pub use event::{ServerEvent, SessionError, SessionEvent};
pub use gate::TrustPredicate;
pub use peer::{PeerHandle, SendError};
pub use server::{BroadcastReport, Listener, Server};
