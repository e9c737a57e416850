//! Connection front end for a streaming XMPP server.
//!
//! The [`sockets`] layer wraps transports behind the [`sockets::Socket`] trait with pooled
//! buffers and operation contexts. [`session::XmlSession`] turns one connection into a
//! stream of [`stanza::Stanza`]s for an [`connection::XmlConnection`] and writes its
//! responses back as a single outgoing document.

pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod negotiator;
pub mod session;
pub mod sockets;
pub mod stanza;
pub mod xml;

pub use connection::{ChannelUpgrade, ConnectionFactory, NoChannelUpgrade, XmlConnection};
pub use error::{SessionError, TransportError};
pub use session::{SessionHandle, SessionOptions, SessionOutcome, XmlSession};
pub use stanza::{Stanza, StanzaResult, StreamAction};
