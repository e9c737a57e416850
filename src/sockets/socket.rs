//! Capability interface over a raw network socket, and its tokio implementation.

use super::buffer_list::BufferList;
use async_trait::async_trait;
use socket2::{Domain, Protocol, SockRef, Type};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Minimal socket capability set used by the streaming layer.
///
/// `receive` fills the declared length of the buffer list (or less) and returns the
/// number of bytes read, `0` meaning the peer closed its side. `send` writes the whole
/// declared length. Timeouts of `None` are infinite.
#[async_trait]
pub trait Socket: Send + Sync + fmt::Debug {
    /// Diagnostic identity, e.g. `tcp://203.0.113.7:50122/`.
    fn identifier(&self) -> &str;

    fn is_connected(&self) -> bool;

    fn receive_timeout(&self) -> Option<Duration>;
    fn set_receive_timeout(&self, timeout: Option<Duration>);
    fn send_timeout(&self) -> Option<Duration>;
    fn set_send_timeout(&self, timeout: Option<Duration>);

    /// Whether small writes go out immediately (Nagle disabled).
    fn no_delay(&self) -> io::Result<bool>;
    fn set_no_delay(&self, enabled: bool) -> io::Result<()>;

    async fn accept(&self) -> io::Result<Arc<dyn Socket>>;
    async fn receive(&self, buffers: &mut BufferList) -> io::Result<usize>;
    async fn send(&self, buffers: &BufferList) -> io::Result<usize>;

    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    /// Best-effort shutdown then close with the given linger. Idempotent.
    fn close(&self, linger: Duration);
}

/// Millisecond timeout cell where zero means "no timeout".
#[derive(Default)]
pub(crate) struct TimeoutCell(AtomicU64);

impl TimeoutCell {
    pub(crate) fn get(&self) -> Option<Duration> {
        match self.0.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub(crate) fn set(&self, timeout: Option<Duration>) {
        let ms = timeout.map(|t| t.as_millis().max(1) as u64).unwrap_or(0);
        self.0.store(ms, Ordering::Relaxed);
    }
}

pub(crate) async fn with_timeout<T>(
    timeout: Option<Duration>,
    op: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, op)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "socket operation timed out"))?,
        None => op.await,
    }
}

enum Inner {
    Listener(TcpListener),
    Stream(TcpStream),
}

/// [`Socket`] over a tokio TCP listener or stream.
pub struct NativeSocket {
    inner: Inner,
    identifier: String,
    closed: AtomicBool,
    receive_timeout: TimeoutCell,
    send_timeout: TimeoutCell,
}

impl fmt::Debug for NativeSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeSocket")
            .field("identifier", &self.identifier)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl NativeSocket {
    pub fn from_stream(stream: TcpStream) -> Self {
        let identifier = match stream.peer_addr() {
            Ok(addr) => format!("tcp://{}/", addr),
            Err(_) => "net://?/".to_string(),
        };
        Self::with_inner(Inner::Stream(stream), identifier)
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        let identifier = match listener.local_addr() {
            Ok(addr) => format!("tcp://{}/", addr),
            Err(_) => "net://?/".to_string(),
        };
        Self::with_inner(Inner::Listener(listener), identifier)
    }

    fn with_inner(inner: Inner, identifier: String) -> Self {
        Self {
            inner,
            identifier,
            closed: AtomicBool::new(false),
            receive_timeout: TimeoutCell::default(),
            send_timeout: TimeoutCell::default(),
        }
    }

    /// Bind a listening socket. IPv6 addresses are bound dual-stack so IPv4 clients
    /// arrive as mapped addresses. Must be called inside a tokio runtime.
    pub fn bind(addr: SocketAddr, backlog: i32) -> io::Result<Self> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if addr.is_ipv6() {
            socket.set_only_v6(false)?;
        }
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;

        let listener = TcpListener::from_std(socket.into())?;
        Ok(Self::from_listener(listener))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.inner {
            Inner::Listener(l) => l.local_addr(),
            Inner::Stream(s) => s.local_addr(),
        }
    }

    fn stream(&self) -> io::Result<&TcpStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket is closed"));
        }
        match &self.inner {
            Inner::Stream(s) => Ok(s),
            Inner::Listener(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "listening socket cannot transfer data",
            )),
        }
    }
}

#[async_trait]
impl Socket for NativeSocket {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn is_connected(&self) -> bool {
        matches!(self.inner, Inner::Stream(_)) && !self.closed.load(Ordering::Acquire)
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
        self.stream()?.nodelay()
    }

    fn set_no_delay(&self, enabled: bool) -> io::Result<()> {
        self.stream()?.set_nodelay(enabled)
    }

    async fn accept(&self) -> io::Result<Arc<dyn Socket>> {
        let listener = match &self.inner {
            Inner::Listener(l) => l,
            Inner::Stream(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "connected socket cannot accept",
                ))
            }
        };
        let (stream, _) = listener.accept().await?;
        Ok(Arc::new(NativeSocket::from_stream(stream)))
    }

    async fn receive(&self, buffers: &mut BufferList) -> io::Result<usize> {
        let stream = self.stream()?;
        if buffers.is_empty() {
            return Ok(0);
        }
        with_timeout(self.receive_timeout(), async {
            loop {
                stream.readable().await?;
                let mut slices = buffers.io_slices_mut();
                match stream.try_read_vectored(&mut slices) {
                    Ok(n) => return Ok::<_, io::Error>(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            }
        })
        .await
    }

    async fn send(&self, buffers: &BufferList) -> io::Result<usize> {
        let stream = self.stream()?;
        with_timeout(self.send_timeout(), async {
            let mut total = 0;
            for segment in buffers.segments() {
                let mut written = 0;
                while written < segment.len() {
                    stream.writable().await?;
                    match stream.try_write(&segment[written..]) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => written += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(e),
                    }
                }
                total += written;
            }
            Ok::<_, io::Error>(total)
        })
        .await
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        SockRef::from(self.stream()?).shutdown(how)
    }

    fn close(&self, linger: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // The descriptor itself is released when the last handle drops.
        if let Inner::Stream(stream) = &self.inner {
            let sock = SockRef::from(stream);
            if let Err(e) = sock.set_linger(Some(linger)) {
                debug!(identifier = %self.identifier, error = %e, "Failed to set linger");
            }
            if let Err(e) = sock.shutdown(Shutdown::Both) {
                debug!(identifier = %self.identifier, error = %e, "Shutdown on close failed");
            }
        }
    }
}
