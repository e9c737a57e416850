//! Seams between the session core and the code that interprets stanzas.

use crate::error::{SessionError, TransportError};
use crate::session::SessionHandle;
use crate::sockets::Socket;
use crate::stanza::{Stanza, StanzaResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Per-connection stanza handler.
///
/// `None` from a callback means "no response, keep going". A callback error ends the
/// session through the error path, like any other failure.
#[async_trait]
pub trait XmlConnection: Send + Sync {
    /// Called before each document starts, including after `Reset` and `StartTls`.
    async fn on_stream_reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_stanza_received(&self, stanza: Stanza) -> anyhow::Result<Option<StanzaResult>>;

    /// Called at most once per session, with the failure that ended it.
    async fn on_error_occurred(&self, error: &SessionError) -> anyhow::Result<Option<StanzaResult>>;
}

/// Creates the handler for each accepted connection.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, handle: SessionHandle) -> anyhow::Result<Arc<dyn XmlConnection>>;
}

/// Replaces a connection's socket with an upgraded channel (e.g. TLS) on `StartTls`.
#[async_trait]
pub trait ChannelUpgrade: Send + Sync {
    async fn upgrade(&self, socket: Arc<dyn Socket>) -> Result<Arc<dyn Socket>, TransportError>;
}

/// Upgrade strategy for plain listeners: every upgrade fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoChannelUpgrade;

#[async_trait]
impl ChannelUpgrade for NoChannelUpgrade {
    async fn upgrade(&self, _socket: Arc<dyn Socket>) -> Result<Arc<dyn Socket>, TransportError> {
        Err(TransportError::UpgradeUnsupported)
    }
}
