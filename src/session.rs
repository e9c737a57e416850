//! One client connection: the stanza read loop, the ordered writer and the protocol
//! actions that tie them together.
//!
//! Reading happens on the session task. Writing happens on a dedicated writer task fed
//! by a FIFO queue, so stanzas from the read loop and from [`SessionHandle`]s never
//! interleave on the wire. Any failure is handed to the connection's error handler
//! exactly once; a failed write records the fault and cancels the session, and the
//! read loop reports it when it unwinds.

use crate::connection::{ChannelUpgrade, NoChannelUpgrade, XmlConnection};
use crate::error::{SessionError, TransportError};
use crate::sockets::{ConnectionStream, Socket};
use crate::stanza::{Stanza, StreamAction};
use crate::xml::{DocumentWriter, ReadEvent, StanzaReader};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default cap on buffered, not yet parsed bytes per connection (1 MiB).
pub const DEFAULT_MAX_STANZA_BYTES: usize = 1024 * 1024;

/// Time allowed to deliver the error handler's response before teardown.
const ERROR_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct SessionOptions {
    pub max_stanza_bytes: usize,
    pub upgrade: Arc<dyn ChannelUpgrade>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_stanza_bytes: DEFAULT_MAX_STANZA_BYTES,
            upgrade: Arc::new(NoChannelUpgrade),
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("max_stanza_bytes", &self.max_stanza_bytes)
            .finish_non_exhaustive()
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The handler asked to close; our document was finalized.
    Closed,
    /// The handler asked to abort; nothing more was written.
    Aborted,
    /// The peer ended its document or disconnected between documents.
    PeerClosed,
    /// The session was canceled from outside.
    Canceled,
    /// A failure was reported to the error handler.
    Failed,
}

type WriteResult = Result<(), SessionError>;

/// A queued write. `stanza: None` is the end-of-document sentinel.
struct WriteRequest {
    stanza: Option<Stanza>,
    done: Option<oneshot::Sender<WriteResult>>,
}

impl WriteRequest {
    fn complete(self, result: WriteResult) {
        if let Some(done) = self.done {
            let _ = done.send(result);
        }
    }
}

#[derive(Default)]
struct WriteQueue {
    requests: VecDeque<WriteRequest>,
    closed: bool,
}

struct Shared {
    conn_id: u64,
    identifier: String,
    cancel: CancellationToken,
    stream: RwLock<Arc<ConnectionStream>>,
    writer: Mutex<DocumentWriter>,
    queue: Mutex<WriteQueue>,
    wake: Notify,
    fault: Mutex<Option<SessionError>>,
}

impl Shared {
    fn stream(&self) -> Arc<ConnectionStream> {
        self.stream.read().clone()
    }

    fn enqueue(&self, request: WriteRequest) {
        let mut queue = self.queue.lock();
        if queue.closed {
            drop(queue);
            request.complete(Err(SessionError::WriterClosed));
            return;
        }
        queue.requests.push_back(request);
        drop(queue);
        self.wake.notify_one();
    }

    /// Queue `stanza` (or the sentinel) and wait until it is on the wire.
    async fn write(&self, stanza: Option<Stanza>) -> WriteResult {
        let (tx, rx) = oneshot::channel();
        self.enqueue(WriteRequest {
            stanza,
            done: Some(tx),
        });
        rx.await.unwrap_or(Err(SessionError::WriterClosed))
    }

    fn pop(&self) -> Option<WriteRequest> {
        self.queue.lock().requests.pop_front()
    }

    /// Refuse further writes and fail whatever is still queued.
    fn close_queue(&self) {
        let abandoned = {
            let mut queue = self.queue.lock();
            queue.closed = true;
            std::mem::take(&mut queue.requests)
        };
        for request in abandoned {
            request.complete(Err(SessionError::WriterClosed));
        }
    }

    /// Record the first failure and stop the session.
    fn fail(&self, error: SessionError) {
        if self.cancel.is_cancelled() {
            debug!(conn_id = self.conn_id, error = %error, "Failure after termination ignored");
            return;
        }
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(error);
        }
        drop(fault);
        self.cancel.cancel();
    }

    fn take_fault(&self) -> Option<SessionError> {
        self.fault.lock().take()
    }
}

async fn run_writer(shared: Arc<Shared>) {
    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = shared.wake.notified() => {}
        }
        match drain(&shared).await {
            Ok(false) => {}
            Ok(true) => break,
            Err(e) => {
                shared.fail(e);
                break;
            }
        }
    }
    shared.close_queue();
}

/// Write every queued request. Returns `true` once the sentinel finalized the document.
async fn drain(shared: &Shared) -> Result<bool, SessionError> {
    while let Some(request) = shared.pop() {
        let mut bytes = Vec::new();
        let serialized = {
            let mut writer = shared.writer.lock();
            match &request.stanza {
                Some(stanza) => writer.write_stanza(stanza, &mut bytes),
                None => writer.finish(&mut bytes),
            }
        };
        if let Err(e) = serialized {
            request.complete(Err(SessionError::WriterClosed));
            return Err(e);
        }

        let stream = shared.stream();
        let sent = match stream.write_all(&bytes, &shared.cancel).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            request.complete(Err(SessionError::WriterClosed));
            return Err(e.into());
        }
        debug!(
            conn_id = shared.conn_id,
            bytes = bytes.len(),
            data = %String::from_utf8_lossy(&bytes),
            "Sent"
        );

        let finished = request.stanza.is_none();
        request.complete(Ok(()));
        if finished {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Outbound interface of a session, handed to the connection handler.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("conn_id", &self.shared.conn_id)
            .field("identifier", &self.shared.identifier)
            .finish()
    }
}

impl SessionHandle {
    pub fn conn_id(&self) -> u64 {
        self.shared.conn_id
    }

    pub fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    /// Queue a stanza without waiting. A failed write ends the session via the error handler.
    pub fn write_stanza(&self, stanza: Stanza) {
        self.shared.enqueue(WriteRequest {
            stanza: Some(stanza),
            done: None,
        });
    }

    /// Queue a stanza and wait until it has been written and flushed.
    pub async fn write_stanza_async(&self, stanza: Stanza) -> Result<(), SessionError> {
        self.shared.write(Some(stanza)).await
    }

    /// Ask the session to terminate.
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

/// A session over one accepted socket. Create it, hand [`XmlSession::handle`] to the
/// connection factory, then drive it with [`XmlSession::run`].
pub struct XmlSession {
    shared: Arc<Shared>,
    options: SessionOptions,
}

impl XmlSession {
    pub fn new(
        socket: Arc<dyn Socket>,
        conn_id: u64,
        cancel: CancellationToken,
        options: SessionOptions,
    ) -> Self {
        let identifier = socket.identifier().to_string();
        let shared = Arc::new(Shared {
            conn_id,
            identifier,
            cancel,
            stream: RwLock::new(Arc::new(ConnectionStream::new(socket))),
            writer: Mutex::new(DocumentWriter::new()),
            queue: Mutex::new(WriteQueue::default()),
            wake: Notify::new(),
            fault: Mutex::new(None),
        });
        Self { shared, options }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run until the stream ends, then tear the connection down.
    pub async fn run(self, connection: Arc<dyn XmlConnection>) -> SessionOutcome {
        let conn_id = self.shared.conn_id;
        let started = Instant::now();
        info!(conn_id, identifier = %self.shared.identifier, "Session started");

        let writer = tokio::spawn(run_writer(self.shared.clone()));

        let outcome = match self.process(connection.as_ref()).await {
            Ok(outcome) => outcome,
            Err(error) => match self.shared.take_fault() {
                Some(fault) => self.report_error(connection.as_ref(), fault).await,
                None if self.shared.cancel.is_cancelled() => SessionOutcome::Canceled,
                None => self.report_error(connection.as_ref(), error).await,
            },
        };

        self.shared.cancel.cancel();
        if let Err(e) = writer.await {
            warn!(conn_id, error = %e, "Writer task failed");
        }
        self.shared.stream().close();

        info!(
            conn_id,
            outcome = ?outcome,
            total_ms = started.elapsed().as_millis() as u64,
            "Session ended"
        );
        outcome
    }

    async fn process(&self, connection: &dyn XmlConnection) -> Result<SessionOutcome, SessionError> {
        let conn_id = self.shared.conn_id;
        let mut leftover = Vec::new();

        'document: loop {
            self.shared.writer.lock().reset();
            self.dispatch(connection.on_stream_reset()).await?;
            let mut reader =
                StanzaReader::with_leftover(std::mem::take(&mut leftover), self.options.max_stanza_bytes);
            debug!(conn_id, carried = reader.buffered(), "Document started");

            loop {
                let stream = self.shared.stream();
                let stanza = match reader.read(&stream, &self.shared.cancel).await? {
                    ReadEvent::Stanza(stanza) => stanza,
                    ReadEvent::EndOfDocument => {
                        info!(conn_id, "Peer ended the stream");
                        self.shared.write(None).await?;
                        return Ok(SessionOutcome::PeerClosed);
                    }
                };
                debug!(conn_id, stanza = ?stanza, "Received");

                let Some(result) = self.dispatch(connection.on_stanza_received(stanza)).await? else {
                    continue;
                };
                let (action, response) = result.into_parts();
                if let Some(response) = response {
                    self.shared.write(Some(response)).await?;
                }
                if action != StreamAction::Continue {
                    info!(conn_id, action = ?action, restart = action.restarts_stream(), "Stream action");
                }

                match action {
                    StreamAction::Continue => {}
                    StreamAction::Close => {
                        self.shared.write(None).await?;
                        return Ok(SessionOutcome::Closed);
                    }
                    StreamAction::Abort => return Ok(SessionOutcome::Aborted),
                    StreamAction::Reset => {
                        leftover = reader.into_leftover();
                        continue 'document;
                    }
                    StreamAction::StartTls => {
                        drop(reader);
                        self.upgrade_channel().await?;
                        continue 'document;
                    }
                }
            }
        }
    }

    /// Await a handler callback, giving up if the session is canceled.
    async fn dispatch<T>(&self, callback: impl Future<Output = anyhow::Result<T>>) -> Result<T, SessionError> {
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => Err(TransportError::Canceled.into()),
            result = callback => result.map_err(SessionError::Handler),
        }
    }

    async fn upgrade_channel(&self) -> Result<(), SessionError> {
        let current = self.shared.stream();
        let upgraded = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return Err(TransportError::Canceled.into()),
            upgraded = self.options.upgrade.upgrade(current.socket().clone()) => upgraded?,
        };
        // The upgraded channel owns the socket now.
        if current.detach().is_none() {
            return Err(TransportError::Closed.into());
        }
        *self.shared.stream.write() = Arc::new(ConnectionStream::new(upgraded));
        info!(conn_id = self.shared.conn_id, "Channel upgraded");
        Ok(())
    }

    async fn report_error(&self, connection: &dyn XmlConnection, error: SessionError) -> SessionOutcome {
        let conn_id = self.shared.conn_id;
        warn!(conn_id, identifier = %self.shared.identifier, error = %error, "Session failed");

        let result = match connection.on_error_occurred(&error).await {
            Ok(result) => result,
            Err(e) => {
                error!(conn_id, error = %e, "Error handler failed");
                None
            }
        };
        if let Some(result) = result {
            let (action, response) = result.into_parts();
            let deliver = async {
                if let Some(response) = response {
                    self.shared.write(Some(response)).await?;
                }
                if action == StreamAction::Close {
                    self.shared.write(None).await?;
                }
                Ok::<_, SessionError>(())
            };
            match tokio::time::timeout(ERROR_RESPONSE_TIMEOUT, deliver).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(conn_id, error = %e, "Error response not delivered"),
                Err(_) => debug!(conn_id, "Error response timed out"),
            }
        }
        SessionOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sockets::{MemoryPeer, MemorySocket};
    use crate::stanza::StanzaResult;
    use crate::xml::{ns, Element};
    use async_trait::async_trait;

    const WAIT: Duration = Duration::from_secs(2);
    const CLIENT_HEADER: &str =
        "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";
    const DECL: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>";

    type Reply = dyn Fn(&Stanza) -> anyhow::Result<Option<StanzaResult>> + Send + Sync;

    #[derive(Default)]
    struct Log {
        received: Vec<Stanza>,
        errors: Vec<String>,
        resets: usize,
    }

    impl Log {
        fn names(&self) -> Vec<String> {
            self.received.iter().map(|s| s.element().name().to_string()).collect()
        }
    }

    struct Scripted {
        reply: Box<Reply>,
        error_reply: Option<StanzaResult>,
        log: Arc<Mutex<Log>>,
    }

    #[async_trait]
    impl XmlConnection for Scripted {
        async fn on_stream_reset(&self) -> anyhow::Result<()> {
            self.log.lock().resets += 1;
            Ok(())
        }

        async fn on_stanza_received(&self, stanza: Stanza) -> anyhow::Result<Option<StanzaResult>> {
            let reply = (self.reply)(&stanza);
            self.log.lock().received.push(stanza);
            reply
        }

        async fn on_error_occurred(&self, error: &SessionError) -> anyhow::Result<Option<StanzaResult>> {
            self.log.lock().errors.push(error.to_string());
            Ok(self.error_reply.clone())
        }
    }

    /// Hands back the socket it was given.
    struct PassThrough;

    #[async_trait]
    impl ChannelUpgrade for PassThrough {
        async fn upgrade(&self, socket: Arc<dyn Socket>) -> Result<Arc<dyn Socket>, TransportError> {
            Ok(socket)
        }
    }

    struct Harness {
        peer: MemoryPeer,
        socket: Arc<MemorySocket>,
        handle: SessionHandle,
        log: Arc<Mutex<Log>>,
        task: tokio::task::JoinHandle<SessionOutcome>,
    }

    fn spawn_session(
        reply: impl Fn(&Stanza) -> anyhow::Result<Option<StanzaResult>> + Send + Sync + 'static,
        error_reply: Option<StanzaResult>,
        options: SessionOptions,
    ) -> Harness {
        let (socket, peer) = MemorySocket::pair();
        let session = XmlSession::new(socket.clone(), 7, CancellationToken::new(), options);
        let handle = session.handle();
        let log = Arc::new(Mutex::new(Log::default()));
        let connection = Arc::new(Scripted {
            reply: Box::new(reply),
            error_reply,
            log: log.clone(),
        });
        let task = tokio::spawn(session.run(connection));
        Harness {
            peer,
            socket,
            handle,
            log,
            task,
        }
    }

    fn server_header() -> Stanza {
        Stanza::from_opening_tag(
            Element::new("stream:stream")
                .with_attr("xmlns:stream", ns::STREAMS)
                .with_attr("xmlns", ns::CLIENT),
        )
    }

    fn full(name: &str) -> Stanza {
        Stanza::from_full_element(Element::new(name))
    }

    /// Answer stream headers with our own header, ignore everything else.
    fn header_only(stanza: &Stanza) -> anyhow::Result<Option<StanzaResult>> {
        Ok(stanza
            .is_opening_tag_only()
            .then(|| StanzaResult::respond(server_header())))
    }

    async fn open_stream(h: &mut Harness) {
        h.peer.send(CLIENT_HEADER);
        h.peer.read_until("<stream:stream", WAIT).await;
    }

    async fn outcome(h: Harness) -> SessionOutcome {
        tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_response_then_close_finalizes_document() {
        let mut h = spawn_session(
            |stanza| match stanza.element().name() {
                "iq" => Ok(Some(StanzaResult::new(
                    StreamAction::Close,
                    Some(Stanza::from_full_element(
                        Element::new("iq").with_attr("type", "result").with_attr("id", "1"),
                    )),
                ))),
                _ => header_only(stanza),
            },
            None,
            SessionOptions::default(),
        );

        h.peer.send(format!("{}<iq type='get' id='1'/>", CLIENT_HEADER));
        let output = h.peer.read_until("</stream:stream>", WAIT).await;
        assert_eq!(
            output,
            format!(
                "{}<stream:stream xmlns:stream=\"{}\" xmlns=\"{}\"><iq type=\"result\" id=\"1\"/></stream:stream>",
                DECL,
                ns::STREAMS,
                ns::CLIENT
            )
        );

        let socket = h.socket.clone();
        let log = h.log.clone();
        assert_eq!(outcome(h).await, SessionOutcome::Closed);
        assert_eq!(log.lock().names(), ["stream:stream", "iq"]);
        assert!(log.lock().errors.is_empty());
        assert_eq!(socket.close_count(), 1);
    }

    #[tokio::test]
    async fn test_peer_end_of_document_closes_gracefully() {
        let mut h = spawn_session(header_only, None, SessionOptions::default());
        open_stream(&mut h).await;
        h.peer.send("<message/></stream:stream>");
        h.peer.read_until("</stream:stream>", WAIT).await;

        let log = h.log.clone();
        assert_eq!(outcome(h).await, SessionOutcome::PeerClosed);
        assert_eq!(log.lock().names(), ["stream:stream", "message"]);
        assert!(log.lock().errors.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_before_header_is_not_an_error() {
        let mut h = spawn_session(header_only, None, SessionOptions::default());
        h.peer.hang_up();
        let log = h.log.clone();
        assert_eq!(outcome(h).await, SessionOutcome::PeerClosed);
        assert!(log.lock().errors.is_empty());
    }

    #[tokio::test]
    async fn test_reset_restarts_document_with_carried_bytes() {
        let mut h = spawn_session(
            |stanza| match stanza.element().name() {
                "auth" => Ok(Some(StanzaResult::new(StreamAction::Reset, Some(full("success"))))),
                _ => header_only(stanza),
            },
            None,
            SessionOptions::default(),
        );
        open_stream(&mut h).await;

        h.peer.send(format!("<auth/>{}", CLIENT_HEADER));
        let output = h
            .peer
            .read_until(&format!("<success/>{}<stream:stream", DECL), WAIT)
            .await;
        assert_eq!(output.matches(DECL).count(), 2);

        h.peer.send("</stream:stream>");
        h.peer.read_until("</stream:stream>", WAIT).await;
        let log = h.log.clone();
        assert_eq!(outcome(h).await, SessionOutcome::PeerClosed);
        let log = log.lock();
        assert_eq!(log.resets, 2);
        assert_eq!(log.names(), ["stream:stream", "auth", "stream:stream"]);
        assert!(log.received[2].is_opening_tag_only());
    }

    #[tokio::test]
    async fn test_abort_writes_nothing_more() {
        let mut h = spawn_session(
            |stanza| match stanza.element().name() {
                "bye" => Ok(Some(StanzaResult::action(StreamAction::Abort))),
                _ => header_only(stanza),
            },
            None,
            SessionOptions::default(),
        );
        open_stream(&mut h).await;
        h.peer.send("<bye/>");

        let socket = h.socket.clone();
        let log = h.log.clone();
        let mut peer = std::mem::replace(&mut h.peer, MemorySocket::pair().1);
        assert_eq!(outcome(h).await, SessionOutcome::Aborted);
        assert!(log.lock().errors.is_empty());
        assert_eq!(socket.close_count(), 1);
        let rest = peer.read_to_end(Duration::from_millis(100)).await;
        assert!(!rest.contains("</stream:stream>"));
    }

    #[tokio::test]
    async fn test_malformed_input_reported_once_and_answered() {
        let error_reply = StanzaResult::new(
            StreamAction::Close,
            Some(Stanza::from_full_element(
                Element::new("stream:error").with_child(Element::with_ns("not-well-formed", ns::STREAM_ERRORS)),
            )),
        );
        let mut h = spawn_session(header_only, Some(error_reply), SessionOptions::default());
        open_stream(&mut h).await;
        h.peer.send("<iq></query>");

        let output = h.peer.read_until("</stream:stream>", WAIT).await;
        assert!(output.contains("<stream:error><not-well-formed xmlns=\"urn:ietf:params:xml:ns:xmpp-streams\"/></stream:error></stream:stream>"));

        let log = h.log.clone();
        assert_eq!(outcome(h).await, SessionOutcome::Failed);
        assert_eq!(log.lock().errors.len(), 1);
        assert!(log.lock().errors[0].contains("not well-formed"));
    }

    #[tokio::test]
    async fn test_eof_mid_document_is_reported() {
        let mut h = spawn_session(header_only, None, SessionOptions::default());
        open_stream(&mut h).await;
        h.peer.send("<iq>");
        h.peer.hang_up();

        let log = h.log.clone();
        assert_eq!(outcome(h).await, SessionOutcome::Failed);
        assert_eq!(log.lock().errors, ["connection closed in the middle of the stream"]);
    }

    #[tokio::test]
    async fn test_handler_failure_is_reported() {
        let mut h = spawn_session(
            |stanza| match stanza.element().name() {
                "iq" => Err(anyhow::anyhow!("roster backend unavailable")),
                _ => header_only(stanza),
            },
            None,
            SessionOptions::default(),
        );
        open_stream(&mut h).await;
        h.peer.send("<iq/>");

        let log = h.log.clone();
        assert_eq!(outcome(h).await, SessionOutcome::Failed);
        assert_eq!(log.lock().errors, ["connection handler failed"]);
    }

    #[tokio::test]
    async fn test_start_tls_without_upgrade_takes_error_path() {
        let mut h = spawn_session(
            |stanza| match stanza.element().local_name() {
                "starttls" => Ok(Some(StanzaResult::new(
                    StreamAction::StartTls,
                    Some(Stanza::from_full_element(Element::with_ns("proceed", ns::TLS))),
                ))),
                _ => header_only(stanza),
            },
            None,
            SessionOptions::default(),
        );
        open_stream(&mut h).await;
        h.peer.send(format!("<starttls xmlns='{}'/>", ns::TLS));
        h.peer.read_until("<proceed", WAIT).await;

        let log = h.log.clone();
        assert_eq!(outcome(h).await, SessionOutcome::Failed);
        assert_eq!(log.lock().errors, [TransportError::UpgradeUnsupported.to_string()]);
    }

    #[tokio::test]
    async fn test_start_tls_swaps_stream_and_discards_unparsed_bytes() {
        let options = SessionOptions {
            upgrade: Arc::new(PassThrough),
            ..SessionOptions::default()
        };
        let mut h = spawn_session(
            |stanza| match stanza.element().local_name() {
                "starttls" => Ok(Some(StanzaResult::new(
                    StreamAction::StartTls,
                    Some(Stanza::from_full_element(Element::with_ns("proceed", ns::TLS))),
                ))),
                _ => header_only(stanza),
            },
            None,
            options,
        );
        open_stream(&mut h).await;
        h.peer.send(format!("<starttls xmlns='{}'/><junk/>", ns::TLS));
        h.peer.read_until("<proceed", WAIT).await;

        h.peer.send(CLIENT_HEADER);
        let output = h
            .peer
            .read_until(&format!("/>{}<stream:stream", DECL), WAIT)
            .await;
        assert_eq!(output.matches(DECL).count(), 2);

        h.handle.close();
        let socket = h.socket.clone();
        let log = h.log.clone();
        assert_eq!(outcome(h).await, SessionOutcome::Canceled);
        assert_eq!(socket.close_count(), 1);
        let log = log.lock();
        assert_eq!(log.names(), ["stream:stream", "starttls", "stream:stream"]);
        assert_eq!(log.resets, 2);
        assert!(log.errors.is_empty());
    }

    #[tokio::test]
    async fn test_writes_keep_submission_order() {
        let mut h = spawn_session(header_only, None, SessionOptions::default());
        open_stream(&mut h).await;

        for i in 0..50 {
            h.handle
                .write_stanza(Stanza::from_full_element(Element::new("m").with_attr("n", i.to_string())));
        }
        h.handle.write_stanza_async(full("done")).await.unwrap();

        let output = h.peer.read_until("<done/>", WAIT).await;
        let positions: Vec<usize> = (0..50)
            .map(|i| output.find(&format!("<m n=\"{}\"/>", i)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_interleave() {
        let mut h = spawn_session(header_only, None, SessionOptions::default());
        open_stream(&mut h).await;

        let writers: Vec<_> = (0..8)
            .map(|w| {
                let handle = h.handle.clone();
                tokio::spawn(async move {
                    for i in 0..10 {
                        let stanza = Element::new("c").with_attr("n", format!("{}-{}", w, i)).with_text("body");
                        handle.write_stanza_async(Stanza::from_full_element(stanza)).await.unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }
        h.handle.write_stanza_async(full("done")).await.unwrap();

        let output = h.peer.read_until("<done/>", WAIT).await;
        assert_eq!(output.matches("<c n=\"").count(), 80);
        assert_eq!(output.matches(">body</c>").count(), 80);
    }

    #[tokio::test]
    async fn test_write_failure_routes_to_error_handler() {
        let mut h = spawn_session(header_only, None, SessionOptions::default());
        open_stream(&mut h).await;
        h.peer.stop_receiving();
        h.handle.write_stanza(full("ping"));

        let log = h.log.clone();
        assert_eq!(outcome(h).await, SessionOutcome::Failed);
        let errors = &log.lock().errors;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("peer is gone"), "{:?}", errors);
    }

    #[tokio::test]
    async fn test_writes_after_close_fail() {
        let mut h = spawn_session(
            |stanza| match stanza.element().name() {
                "bye" => Ok(Some(StanzaResult::action(StreamAction::Close))),
                _ => header_only(stanza),
            },
            None,
            SessionOptions::default(),
        );
        open_stream(&mut h).await;
        h.peer.send("<bye/>");
        h.peer.read_until("</stream:stream>", WAIT).await;

        let handle = h.handle.clone();
        assert_eq!(outcome(h).await, SessionOutcome::Closed);
        assert!(matches!(
            handle.write_stanza_async(full("late")).await,
            Err(SessionError::WriterClosed)
        ));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_sentinel_stops_writes_queued_behind_it() {
        let (socket, mut peer) = MemorySocket::pair();
        let session = XmlSession::new(socket, 11, CancellationToken::new(), SessionOptions::default());
        let shared = session.shared.clone();

        let mut pending = Vec::new();
        for stanza in [
            Some(Stanza::from_opening_tag(Element::new("s"))),
            None,
            Some(full("late")),
        ] {
            let (tx, rx) = oneshot::channel();
            shared.enqueue(WriteRequest {
                stanza,
                done: Some(tx),
            });
            pending.push(rx);
        }
        tokio::time::timeout(WAIT, run_writer(shared.clone())).await.unwrap();

        let mut results = Vec::new();
        for rx in pending {
            results.push(rx.await.unwrap());
        }
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(SessionError::WriterClosed)));

        let output = peer.read_until("</s>", WAIT).await;
        assert_eq!(output, format!("{}<s></s>", DECL));
        assert!(tokio::time::timeout(Duration::from_millis(50), peer.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_external_cancel_is_not_reported() {
        let mut h = spawn_session(header_only, None, SessionOptions::default());
        open_stream(&mut h).await;
        h.handle.close();
        let log = h.log.clone();
        assert_eq!(outcome(h).await, SessionOutcome::Canceled);
        assert!(log.lock().errors.is_empty());
    }
}
