//! Error types for the socket layer and the stanza session.

use std::io;

/// Failures raised by sockets, pooled I/O contexts and the connection stream.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("operation canceled")]
    Canceled,
    /// A second operation was started on a context that already has one in flight.
    #[error("object in use: an operation is already pending on this context")]
    ContextInUse,
    #[error("socket is closed")]
    Closed,
    #[error("socket operation timed out")]
    TimedOut,
    #[error("channel upgrade is not supported on this connection")]
    UpgradeUnsupported,
    #[error("operation not supported by this socket: {0}")]
    Unsupported(&'static str),
}

impl TransportError {
    /// True for failures caused by cancellation rather than the peer or the OS.
    pub fn is_canceled(&self) -> bool {
        matches!(self, TransportError::Canceled)
    }
}

/// Failures that end a stanza session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("XML is not well-formed: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("XML is not well-formed: {0}")]
    Malformed(String),
    #[error("restricted XML construct: {0}")]
    Restricted(&'static str),
    #[error("stanza buffer exceeded size limit ({buffered} > {limit} bytes)")]
    StanzaTooLarge { buffered: usize, limit: usize },
    #[error("connection closed in the middle of the stream")]
    UnexpectedEof,
    #[error("stanza writer is closed")]
    WriterClosed,
    #[error("failed to serialize stanza: {0}")]
    Serialize(String),
    #[error("connection handler failed")]
    Handler(#[source] anyhow::Error),
}

impl SessionError {
    /// True when the peer sent input the reader rejected, as opposed to a transport
    /// or handler failure. Collaborators answer these with a `not-well-formed` stream error.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            SessionError::Xml(_)
                | SessionError::Malformed(_)
                | SessionError::Restricted(_)
                | SessionError::StanzaTooLarge { .. }
        )
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, SessionError::Transport(e) if e.is_canceled())
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Transport(TransportError::Io(e))
    }
}
