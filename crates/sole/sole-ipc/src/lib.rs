//! Local-socket side of single-instance coordination.
//!
//! The primary runs a [`Listener`] that drives one [`ConnectionSession`] per
//! accepted socket from a single-threaded event loop. Secondaries use a [`Connector`]
//! to perform the handshake and push framed payloads, each confirmed by a
//! one-byte acknowledgement.

mod connector;
mod error;
mod events;
mod listener;
mod session;
mod wire;

pub use connector::Connector;
pub use error::IpcError;
pub use events::{InstanceEvent, InstanceEvents};
pub use listener::{Listener, ListenerWaker, SocketAccess, socket_path};
pub use session::{ConnectionSession, HandshakePolicy, HandshakeRejected, SessionAction, Stage};
pub use wire::{ACK, ConnectionKind, HEADER_LEN, InitMessage, MAX_INIT_BODY_LEN, WireError};
