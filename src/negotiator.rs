//! Built-in handler for unauthenticated connections: answers the stream header with
//! the stream features and turns failures into stream errors.

use crate::connection::{ConnectionFactory, XmlConnection};
use crate::error::SessionError;
use crate::session::SessionHandle;
use crate::stanza::{Stanza, StanzaResult, StreamAction};
use crate::xml::{ns, Element};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct NegotiatorState {
    has_header: bool,
    streams: u64,
}

/// Per-connection stream negotiator.
#[derive(Debug)]
pub struct StreamNegotiator {
    handle: SessionHandle,
    mechanisms: Arc<[String]>,
    tls_available: bool,
    state: Mutex<NegotiatorState>,
}

impl StreamNegotiator {
    pub fn new(handle: SessionHandle, mechanisms: Arc<[String]>, tls_available: bool) -> Self {
        Self {
            handle,
            mechanisms,
            tls_available,
            state: Mutex::new(NegotiatorState::default()),
        }
    }

    fn header(&self, request: &Element, stream_no: u64) -> Element {
        let mut header = Element::new("stream:stream")
            .with_attr("xmlns:stream", ns::STREAMS)
            .with_attr("xmlns", ns::CLIENT)
            .with_attr("version", "1.0")
            .with_attr("id", format!("{}-{}", self.handle.conn_id(), stream_no));
        if let Some(domain) = request.attr("to") {
            header.set_attr("from", domain);
        }
        header.with_child(self.features())
    }

    fn features(&self) -> Element {
        let mut features = Element::new("stream:features");
        if self.tls_available {
            features = features.with_child(Element::with_ns("starttls", ns::TLS));
        }
        if !self.mechanisms.is_empty() {
            let mechanisms = self
                .mechanisms
                .iter()
                .fold(Element::with_ns("mechanisms", ns::SASL), |list, name| {
                    list.with_child(Element::new("mechanism").with_text(name.as_str()))
                });
            features = features.with_child(mechanisms);
        }
        features
    }
}

/// `<stream:error><{condition} xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>`
pub fn stream_error(condition: &str) -> Stanza {
    Stanza::from_full_element(
        Element::new("stream:error").with_child(Element::with_ns(condition, ns::STREAM_ERRORS)),
    )
}

#[async_trait]
impl XmlConnection for StreamNegotiator {
    async fn on_stream_reset(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.has_header = false;
        state.streams += 1;
        Ok(())
    }

    async fn on_stanza_received(&self, stanza: Stanza) -> anyhow::Result<Option<StanzaResult>> {
        let element = stanza.element();

        if element.is("stream", Some(ns::STREAMS)) {
            let stream_no = {
                let mut state = self.state.lock();
                if state.has_header {
                    None
                } else {
                    state.has_header = true;
                    Some(state.streams)
                }
            };
            return Ok(Some(match stream_no {
                Some(stream_no) => {
                    debug!(conn_id = self.handle.conn_id(), to = ?element.attr("to"), "Stream opened");
                    StanzaResult::respond(Stanza::from_opening_tag(self.header(element, stream_no)))
                }
                None => StanzaResult::new(StreamAction::Close, Some(stream_error("bad-format"))),
            }));
        }

        if element.is("starttls", Some(ns::TLS)) {
            return Ok(Some(if self.tls_available {
                StanzaResult::new(
                    StreamAction::StartTls,
                    Some(Stanza::from_full_element(Element::with_ns("proceed", ns::TLS))),
                )
            } else {
                StanzaResult::new(
                    StreamAction::Close,
                    Some(Stanza::from_full_element(Element::with_ns("failure", ns::TLS))),
                )
            }));
        }

        Ok(None)
    }

    async fn on_error_occurred(&self, error: &SessionError) -> anyhow::Result<Option<StanzaResult>> {
        let condition = if error.is_malformed_input() {
            "not-well-formed"
        } else {
            "internal-server-error"
        };
        info!(
            conn_id = self.handle.conn_id(),
            identifier = self.handle.identifier(),
            condition,
            "Closing stream with error"
        );
        Ok(Some(StanzaResult::new(StreamAction::Close, Some(stream_error(condition)))))
    }
}

/// Creates a [`StreamNegotiator`] for every accepted connection.
#[derive(Debug, Clone)]
pub struct NegotiatorFactory {
    mechanisms: Arc<[String]>,
    tls_available: bool,
}

impl NegotiatorFactory {
    pub fn new(mechanisms: Vec<String>, tls_available: bool) -> Self {
        Self {
            mechanisms: mechanisms.into(),
            tls_available,
        }
    }
}

#[async_trait]
impl ConnectionFactory for NegotiatorFactory {
    async fn create(&self, handle: SessionHandle) -> anyhow::Result<Arc<dyn XmlConnection>> {
        Ok(Arc::new(StreamNegotiator::new(
            handle,
            self.mechanisms.clone(),
            self.tls_available,
        )))
    }
}
