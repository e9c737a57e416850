//! Byte-stream adapter over a [`Socket`] using pooled data contexts.

use super::context::DataContext;
use super::socket::Socket;
use crate::error::TransportError;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Linger applied by the final close stage.
pub const CLOSE_LINGER: Duration = Duration::from_millis(100);

const OPEN: u8 = 0;
const SHUT_DOWN: u8 = 1;
const CLOSED: u8 = 2;
const DETACHED: u8 = 3;

/// Readable and writable stream over one connected socket.
///
/// Every read or write checks a [`DataContext`] out of the shared pool for the duration
/// of that single operation. Closing runs in two stages, shutdown and then close, each
/// performed at most once no matter how many callers race on it. Dropping the stream
/// closes it unless the socket was [detached](ConnectionStream::detach).
#[derive(Debug)]
pub struct ConnectionStream {
    socket: Arc<dyn Socket>,
    state: AtomicU8,
}

impl ConnectionStream {
    pub fn new(socket: Arc<dyn Socket>) -> Self {
        Self {
            socket,
            state: AtomicU8::new(OPEN),
        }
    }

    pub fn socket(&self) -> &Arc<dyn Socket> {
        &self.socket
    }

    pub fn identifier(&self) -> &str {
        self.socket.identifier()
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means end of stream.
    pub async fn read(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize, TransportError> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut ctx = DataContext::check_out();
        ctx.receive(&*self.socket, buf, cancel).await
    }

    pub async fn write_all(&self, buf: &[u8], cancel: &CancellationToken) -> Result<(), TransportError> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(());
        }
        let mut ctx = DataContext::check_out();
        let sent = ctx.send(&*self.socket, buf, cancel).await?;
        if sent < buf.len() {
            return Err(TransportError::Io(io::ErrorKind::WriteZero.into()));
        }
        Ok(())
    }

    /// Socket sends are unbuffered, so this only reports a closed stream.
    pub async fn flush(&self) -> Result<(), TransportError> {
        self.ensure_open()
    }

    /// Shut the socket down in both directions, then close it with [`CLOSE_LINGER`].
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(OPEN, SHUT_DOWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Err(e) = self.socket.shutdown(Shutdown::Both) {
                debug!(identifier = self.identifier(), error = %e, "Shutdown failed");
            }
        }
        if self
            .state
            .compare_exchange(SHUT_DOWN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.socket.close(CLOSE_LINGER);
        }
    }

    /// Give up ownership of the socket without closing it, e.g. before wrapping it in
    /// an upgraded channel. Returns `None` if the stream is already closing.
    pub fn detach(&self) -> Option<Arc<dyn Socket>> {
        self.state
            .compare_exchange(OPEN, DETACHED, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| self.socket.clone())
    }
}

impl Drop for ConnectionStream {
    fn drop(&mut self) {
        self.close();
    }
}
