//! In-process [`Socket`] implementation driven by channels, for tests.
//!
//! Runs whole sessions without the network: the test holds a [`MemoryPeer`] that
//! plays the remote client.

use super::buffer_list::BufferList;
use super::socket::{with_timeout, Socket, TimeoutCell};
use async_trait::async_trait;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

static NEXT_MEMORY_PORT: AtomicU64 = AtomicU64::new(1);

struct Inbound {
    rx: UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
}

/// Connected end of an in-memory socket pair, or an in-memory listener.
pub struct MemorySocket {
    identifier: String,
    inbound: tokio::sync::Mutex<Inbound>,
    outbound: Option<UnboundedSender<Vec<u8>>>,
    accepts: Option<tokio::sync::Mutex<UnboundedReceiver<Arc<dyn Socket>>>>,
    closed: CancellationToken,
    no_delay: AtomicBool,
    shutdowns: AtomicUsize,
    closes: AtomicUsize,
    receive_timeout: TimeoutCell,
    send_timeout: TimeoutCell,
}

impl std::fmt::Debug for MemorySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySocket")
            .field("identifier", &self.identifier)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

/// The remote side of a [`MemorySocket`].
pub struct MemoryPeer {
    tx: Option<UnboundedSender<Vec<u8>>>,
    rx: UnboundedReceiver<Vec<u8>>,
    received: Vec<u8>,
}

/// Opens connections to an in-memory listener.
#[derive(Clone)]
pub struct MemoryConnector {
    tx: UnboundedSender<Arc<dyn Socket>>,
}

impl MemorySocket {
    fn build(
        identifier: String,
        inbound: UnboundedReceiver<Vec<u8>>,
        outbound: Option<UnboundedSender<Vec<u8>>>,
        accepts: Option<UnboundedReceiver<Arc<dyn Socket>>>,
    ) -> Self {
        Self {
            identifier,
            inbound: tokio::sync::Mutex::new(Inbound {
                rx: inbound,
                pending: Vec::new(),
            }),
            outbound,
            accepts: accepts.map(tokio::sync::Mutex::new),
            closed: CancellationToken::new(),
            no_delay: AtomicBool::new(false),
            shutdowns: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            receive_timeout: TimeoutCell::default(),
            send_timeout: TimeoutCell::default(),
        }
    }

    /// A connected socket and the peer that talks to it.
    pub fn pair() -> (Arc<MemorySocket>, MemoryPeer) {
        let port = NEXT_MEMORY_PORT.fetch_add(1, Ordering::Relaxed);
        let (to_socket, socket_rx) = unbounded_channel();
        let (to_peer, peer_rx) = unbounded_channel();
        let socket = MemorySocket::build(
            format!("mem://peer-{}/", port),
            socket_rx,
            Some(to_peer),
            None,
        );
        let peer = MemoryPeer {
            tx: Some(to_socket),
            rx: peer_rx,
            received: Vec::new(),
        };
        (Arc::new(socket), peer)
    }

    /// A listening socket and a connector that feeds its accept queue.
    pub fn listener() -> (Arc<MemorySocket>, MemoryConnector) {
        let (tx, rx) = unbounded_channel();
        let (_, inbound) = unbounded_channel();
        let socket = MemorySocket::build("mem://listener/".to_string(), inbound, None, Some(rx));
        (Arc::new(socket), MemoryConnector { tx })
    }

    /// How many times the socket was actually shut down (not counting repeats after close).
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::Acquire)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }
}

impl MemoryConnector {
    /// Queue a new connection for the listener and return its remote side.
    pub fn connect(&self) -> io::Result<MemoryPeer> {
        let (socket, peer) = MemorySocket::pair();
        self.tx
            .send(socket)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener is gone"))?;
        Ok(peer)
    }
}

impl MemoryPeer {
    pub fn send(&self, bytes: impl Into<Vec<u8>>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(bytes.into());
        }
    }

    /// Close the sending direction; the socket then reads end-of-stream.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    /// Refuse further output; the socket's sends fail from now on.
    pub fn stop_receiving(&mut self) {
        self.rx.close();
    }

    /// Next chunk the socket sent, or `None` once the socket is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Read until the accumulated output contains `pattern`, returning everything
    /// received so far. Panics after `timeout`, which keeps hung tests short.
    pub async fn read_until(&mut self, pattern: &str, timeout: Duration) -> String {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let text = String::from_utf8_lossy(&self.received).into_owned();
            if text.contains(pattern) {
                return text;
            }
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(chunk)) => self.received.extend_from_slice(&chunk),
                Ok(None) => panic!("socket closed before {:?} arrived; got {:?}", pattern, text),
                Err(_) => panic!("timed out waiting for {:?}; got {:?}", pattern, text),
            }
        }
    }

    /// Wait until the socket side is dropped or closed, returning all output.
    pub async fn read_to_end(&mut self, timeout: Duration) -> String {
        let deadline = tokio::time::Instant::now() + timeout;
        while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, self.rx.recv()).await {
            self.received.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&self.received).into_owned()
    }
}

#[async_trait]
impl Socket for MemorySocket {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn is_connected(&self) -> bool {
        self.outbound.is_some() && !self.closed.is_cancelled()
    }

    fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout.get()
    }

    fn set_receive_timeout(&self, timeout: Option<Duration>) {
        self.receive_timeout.set(timeout);
    }

    fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout.get()
    }

    fn set_send_timeout(&self, timeout: Option<Duration>) {
        self.send_timeout.set(timeout);
    }

    fn no_delay(&self) -> io::Result<bool> {
        Ok(self.no_delay.load(Ordering::Relaxed))
    }

    fn set_no_delay(&self, enabled: bool) -> io::Result<()> {
        self.no_delay.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    async fn accept(&self) -> io::Result<Arc<dyn Socket>> {
        let accepts = self
            .accepts
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a listener"))?;
        let mut accepts = accepts.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(io::ErrorKind::NotConnected.into()),
            next = accepts.recv() => next.ok_or_else(|| io::ErrorKind::NotConnected.into()),
        }
    }

    async fn receive(&self, buffers: &mut BufferList) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket is closed"));
        }
        let mut inbound = self.inbound.lock().await;
        if inbound.pending.is_empty() {
            let chunk = with_timeout(self.receive_timeout(), async {
                tokio::select! {
                    _ = self.closed.cancelled() => Ok::<_, io::Error>(None),
                    chunk = inbound.rx.recv() => Ok(chunk),
                }
            })
            .await?;
            match chunk {
                Some(chunk) => inbound.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = buffers.fill(&inbound.pending);
        inbound.pending.drain(..n);
        Ok(n)
    }

    async fn send(&self, buffers: &BufferList) -> io::Result<usize> {
        let outbound = match &self.outbound {
            Some(tx) if !self.closed.is_cancelled() => tx,
            _ => return Err(io::Error::new(io::ErrorKind::NotConnected, "socket is closed")),
        };
        let mut bytes = Vec::with_capacity(buffers.len());
        for segment in buffers.segments() {
            bytes.extend_from_slice(segment);
        }
        let len = bytes.len();
        outbound
            .send(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer is gone"))?;
        Ok(len)
    }

    fn shutdown(&self, _how: Shutdown) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket is closed"));
        }
        self.shutdowns.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn close(&self, _linger: Duration) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closes.fetch_add(1, Ordering::AcqRel);
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_moves_bytes_both_ways() {
        let (socket, mut peer) = MemorySocket::pair();
        peer.send(b"abcdef".to_vec());

        let mut buffers = BufferList::new();
        buffers.set_length(4);
        assert_eq!(socket.receive(&mut buffers).await.unwrap(), 4);
        assert_eq!(buffers.segment(0), b"abcd");
        assert_eq!(socket.receive(&mut buffers).await.unwrap(), 2);

        buffers.copy_from(b"xyz");
        assert_eq!(socket.send(&buffers).await.unwrap(), 3);
        assert_eq!(peer.recv().await.unwrap(), b"xyz");
    }

    #[tokio::test]
    async fn test_hang_up_reads_end_of_stream() {
        let (socket, mut peer) = MemorySocket::pair();
        peer.hang_up();
        let mut buffers = BufferList::new();
        buffers.set_length(8);
        assert_eq!(socket.receive(&mut buffers).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_pending_receive() {
        let (socket, _peer) = MemorySocket::pair();
        let reader = {
            let socket = socket.clone();
            tokio::spawn(async move {
                let mut buffers = BufferList::new();
                buffers.set_length(8);
                socket.receive(&mut buffers).await
            })
        };
        tokio::task::yield_now().await;
        socket.close(Duration::ZERO);
        socket.close(Duration::ZERO);
        assert_eq!(reader.await.unwrap().unwrap(), 0);
        assert_eq!(socket.close_count(), 1);
        assert!(!socket.is_connected());
    }

    #[tokio::test]
    async fn test_listener_accepts_queued_connections() {
        let (listener, connector) = MemorySocket::listener();
        let mut peer = connector.connect().unwrap();
        let accepted = listener.accept().await.unwrap();
        assert!(accepted.is_connected());

        let mut buffers = BufferList::new();
        buffers.copy_from(b"hi");
        accepted.send(&buffers).await.unwrap();
        assert_eq!(peer.recv().await.unwrap(), b"hi");
    }
}
