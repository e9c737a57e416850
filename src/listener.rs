//! TCP listener: accepts client connections and runs one [`XmlSession`] per connection.

use crate::config::ServerConfig;
use crate::connection::ConnectionFactory;
use crate::error::TransportError;
use crate::session::{SessionOptions, XmlSession};
use crate::sockets::{AcceptContext, NativeSocket, Socket};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Monotonic connection ID for correlating logs across a connection's lifetime.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// RAII guard that decrements the connection counter when dropped.
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        info!(active = prev - 1, "Connection closed");
    }
}

/// Client listener state.
///
/// Started once; [`XmppListener::stop`] cancels the accept loop and every session it
/// spawned.
pub struct XmppListener {
    /// Bound address while running
    local_addr: Option<SocketAddr>,
    /// Accept loop task
    task: Option<JoinHandle<()>>,
    /// Parent of every session's cancellation token
    shutdown: CancellationToken,
    /// Active connection counter (for diagnostics/logging)
    active_connections: Arc<AtomicUsize>,
}

impl XmppListener {
    pub fn new() -> Self {
        Self {
            local_addr: None,
            task: None,
            shutdown: CancellationToken::new(),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind `config.listen` and start accepting connections.
    ///
    /// An IPv6 endpoint is bound dual-stack; if that fails the same port is tried on
    /// the IPv4 wildcard address.
    pub async fn start(
        &mut self,
        config: ServerConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<SocketAddr, TransportError> {
        if self.local_addr.is_some() {
            return Err(TransportError::Unsupported("listener already running"));
        }

        let listener = match NativeSocket::bind(config.listen, config.backlog) {
            Ok(listener) => listener,
            Err(ipv6_err) if config.listen.is_ipv6() => {
                debug!(error = %ipv6_err, "IPv6 bind failed, falling back to IPv4");
                let fallback = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.listen.port());
                NativeSocket::bind(fallback, config.backlog)?
            }
            Err(e) => return Err(e.into()),
        };
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, backlog = config.backlog, "Listening for client connections");

        self.local_addr = Some(local_addr);
        self.shutdown = CancellationToken::new();

        let options = config.plain_session_options();
        let task = tokio::spawn(serve(
            Arc::new(listener),
            factory,
            options,
            config,
            self.shutdown.clone(),
            self.active_connections.clone(),
        ));
        self.task = Some(task);

        Ok(local_addr)
    }

    /// Stop accepting and cancel every running session.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Accept loop ended abnormally");
            }
        }
        self.local_addr = None;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }
}

impl Default for XmppListener {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept loop over any listening [`Socket`]. Returns once `shutdown` fires.
pub async fn serve(
    listener: Arc<dyn Socket>,
    factory: Arc<dyn ConnectionFactory>,
    options: SessionOptions,
    config: ServerConfig,
    shutdown: CancellationToken,
    active_connections: Arc<AtomicUsize>,
) {
    loop {
        let accepted = {
            let context = AcceptContext::check_out();
            context.accept(listener.as_ref(), &shutdown).await
        };
        match accepted {
            Ok(socket) => {
                info!(identifier = socket.identifier(), "New client connection");
                tokio::spawn(handle_connection(
                    socket,
                    factory.clone(),
                    options.clone(),
                    config.clone(),
                    shutdown.child_token(),
                    active_connections.clone(),
                ));
            }
            Err(TransportError::Canceled) => {
                info!("Shutting down");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
    listener.close(Duration::ZERO);
}

async fn handle_connection(
    socket: Arc<dyn Socket>,
    factory: Arc<dyn ConnectionFactory>,
    options: SessionOptions,
    config: ServerConfig,
    cancel: CancellationToken,
    active_connections: Arc<AtomicUsize>,
) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let connection_started = Instant::now();
    let _guard = ConnectionGuard::new(active_connections);

    if let Err(e) = socket.set_no_delay(config.no_delay) {
        debug!(conn_id, error = %e, "Failed to set TCP_NODELAY");
    }
    socket.set_receive_timeout(config.read_timeout);
    socket.set_send_timeout(config.write_timeout);

    let session = XmlSession::new(socket, conn_id, cancel, options);
    let connection = match factory.create(session.handle()).await {
        Ok(connection) => connection,
        Err(e) => {
            error!(conn_id, error = %e, "Failed to create connection handler");
            return;
        }
    };

    let outcome = session.run(connection).await;
    info!(
        conn_id,
        outcome = ?outcome,
        total_ms = connection_started.elapsed().as_millis() as u64,
        "Connection handling finished"
    );
}
