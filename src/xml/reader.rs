//! Incremental stanza reader.
//!
//! Bytes arrive in arbitrary chunks. Each parse pass runs a fresh `quick_xml` reader
//! over the unparsed bytes and stops at the first incomplete construct; whatever was
//! consumed is dropped from the buffer and the rest waits for the next read. The tree
//! under construction lives in `path`, the stack of open elements from the document
//! root down to the insertion point.

use crate::error::SessionError;
use crate::sockets::{Buffer, BufferPool, ConnectionStream};
use crate::stanza::Stanza;
use crate::xml::{ns, Element, Node};
use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Maximum element nesting, the root included.
const MAX_DEPTH: usize = 128;

/// Shortest markup that decides what a `<!` construct is (`<![CDATA[`).
const BANG_PREFIX_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    Stanza(Stanza),
    /// The peer closed its document root, or disconnected before starting one.
    EndOfDocument,
}

#[derive(Default)]
struct TreeBuilder {
    path: Vec<Element>,
    root_seen: bool,
    ended: bool,
}

pub struct StanzaReader {
    tree: TreeBuilder,
    pending: Vec<u8>,
    /// Bytes already folded into the stanza being built.
    stanza_bytes: usize,
    max_stanza_bytes: usize,
    chunk: Buffer,
    pool: Arc<BufferPool>,
}

impl StanzaReader {
    pub fn new(max_stanza_bytes: usize) -> Self {
        Self::with_leftover(Vec::new(), max_stanza_bytes)
    }

    /// Start a new document with bytes left over from a previous reader.
    pub fn with_leftover(leftover: Vec<u8>, max_stanza_bytes: usize) -> Self {
        let pool = BufferPool::global();
        Self {
            tree: TreeBuilder::default(),
            pending: leftover,
            stanza_bytes: 0,
            max_stanza_bytes,
            chunk: pool.take_buffer(),
            pool,
        }
    }

    /// Unparsed bytes, for handing to the next document's reader.
    pub fn into_leftover(mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    pub fn buffered(&self) -> usize {
        self.stanza_bytes + self.pending.len()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Read from `stream` until the next stanza or the end of the document.
    pub async fn read(
        &mut self,
        stream: &ConnectionStream,
        cancel: &CancellationToken,
    ) -> Result<ReadEvent, SessionError> {
        loop {
            if let Some(event) = self.next_event()? {
                return Ok(event);
            }
            let buffered = self.buffered();
            if buffered > self.max_stanza_bytes {
                return Err(SessionError::StanzaTooLarge {
                    buffered,
                    limit: self.max_stanza_bytes,
                });
            }

            let n = stream.read(&mut self.chunk, cancel).await?;
            if n == 0 {
                return if self.at_document_boundary() {
                    Ok(ReadEvent::EndOfDocument)
                } else {
                    Err(SessionError::UnexpectedEof)
                };
            }
            self.pending.extend_from_slice(&self.chunk[..n]);
        }
    }

    /// Parse what is buffered. `None` means more input is needed.
    pub fn next_event(&mut self) -> Result<Option<ReadEvent>, SessionError> {
        if self.tree.ended {
            return Ok(Some(ReadEvent::EndOfDocument));
        }

        let mut reader = Reader::from_reader(&self.pending[..]);
        let config = reader.config_mut();
        config.trim_text(false);
        // End tags are matched against `path`; their start tags may belong to an earlier pass.
        config.check_end_names = false;
        config.allow_unmatched_ends = true;

        let mut consumed = 0;
        let outcome = loop {
            let event = match reader.read_event() {
                Ok(Event::Eof) => break None,
                Ok(event) => event,
                Err(quick_xml::Error::Syntax(e)) if needs_more_input(&e, self.pending.len() - consumed) => {
                    break None
                }
                Err(e) => return Err(e.into()),
            };
            let end = reader.buffer_position() as usize;
            // Text running into the end of the buffer may continue in the next read.
            if matches!(event, Event::Text(_)) && end == self.pending.len() {
                break None;
            }
            consumed = end;
            if let Some(ready) = self.tree.apply(event)? {
                break Some(ready);
            }
        };

        self.pending.drain(..consumed);
        self.stanza_bytes = match outcome {
            Some(_) => 0,
            None => self.stanza_bytes + consumed,
        };
        Ok(outcome)
    }

    fn at_document_boundary(&self) -> bool {
        !self.tree.root_seen && self.pending.iter().all(u8::is_ascii_whitespace)
    }
}

impl Drop for StanzaReader {
    fn drop(&mut self) {
        self.pool.return_buffer(std::mem::take(&mut self.chunk));
    }
}

fn needs_more_input(error: &SyntaxError, remaining: usize) -> bool {
    match error {
        SyntaxError::UnclosedTag
        | SyntaxError::UnclosedComment
        | SyntaxError::UnclosedCData
        | SyntaxError::UnclosedDoctype
        | SyntaxError::UnclosedPIOrXmlDecl => true,
        SyntaxError::InvalidBangMarkup => remaining < BANG_PREFIX_LEN,
        #[allow(unreachable_patterns)]
        _ => false,
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, SessionError> {
    std::str::from_utf8(bytes).map_err(|_| SessionError::Malformed("invalid UTF-8".to_string()))
}

impl TreeBuilder {
    fn apply(&mut self, event: Event<'_>) -> Result<Option<ReadEvent>, SessionError> {
        match event {
            Event::Start(start) => {
                let element = self.open_element(&start)?;
                if !self.root_seen {
                    self.root_seen = true;
                    let opening = Stanza::from_opening_tag(element.clone());
                    self.path.push(element);
                    return Ok(Some(ReadEvent::Stanza(opening)));
                }
                self.path.push(element);
                Ok(None)
            }
            Event::Empty(start) => {
                let element = self.open_element(&start)?;
                if !self.root_seen {
                    self.root_seen = true;
                    self.ended = true;
                    return Ok(Some(ReadEvent::Stanza(Stanza::from_opening_tag(element))));
                }
                Ok(self.complete(element))
            }
            Event::End(end) => {
                let qname = end.name();
                let name = utf8(qname.as_ref())?;
                let element = self
                    .path
                    .pop()
                    .ok_or_else(|| SessionError::Malformed(format!("unexpected end tag </{}>", name)))?;
                if element.name() != name {
                    return Err(SessionError::Malformed(format!(
                        "expected </{}>, found </{}>",
                        element.name(),
                        name
                    )));
                }
                if self.path.is_empty() {
                    self.ended = true;
                    return Ok(Some(ReadEvent::EndOfDocument));
                }
                Ok(self.complete(element))
            }
            Event::Text(text) => {
                if text.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                let text = text.unescape()?.into_owned();
                self.append(Node::Text(text))
            }
            Event::CData(data) => {
                let data = utf8(&data)?.to_string();
                self.append(Node::CData(data))
            }
            Event::Comment(comment) => {
                if self.path.is_empty() {
                    return Ok(None);
                }
                let comment = utf8(&comment)?.to_string();
                self.append(Node::Comment(comment))
            }
            Event::DocType(_) => Err(SessionError::Restricted("doctype")),
            Event::Decl(_) | Event::PI(_) | Event::Eof => Ok(None),
        }
    }

    fn open_element(&self, start: &BytesStart<'_>) -> Result<Element, SessionError> {
        if self.path.len() >= MAX_DEPTH {
            return Err(SessionError::Restricted("element nesting"));
        }
        let mut element = Element::new(utf8(start.name().as_ref())?);
        for attr in start.attributes() {
            let attr = attr.map_err(|e| SessionError::Malformed(e.to_string()))?;
            let key = utf8(attr.key.as_ref())?;
            let value = attr.unescape_value()?;
            element.set_attr(key, value.into_owned());
        }
        let namespace = self.resolve_namespace(&element)?;
        element.set_namespace(namespace);
        Ok(element)
    }

    fn resolve_namespace(&self, element: &Element) -> Result<Option<String>, SessionError> {
        let prefix = element.prefix();
        if prefix == Some("xml") {
            return Ok(Some(ns::XML.to_string()));
        }
        let declared = element
            .declared_namespace(prefix)
            .or_else(|| self.path.iter().rev().find_map(|open| open.declared_namespace(prefix)));
        match (declared, prefix) {
            (Some(""), None) | (None, None) => Ok(None),
            (Some(uri), _) => Ok(Some(uri.to_string())),
            (None, Some(prefix)) => Err(SessionError::Malformed(format!(
                "undeclared namespace prefix '{}'",
                prefix
            ))),
        }
    }

    /// Attach a finished element to its parent, or hand it out when it is a stanza.
    fn complete(&mut self, element: Element) -> Option<ReadEvent> {
        if self.path.len() == 1 {
            // Stray content directly under the root is not kept past the next stanza.
            if let Some(root) = self.path.first_mut() {
                root.clear_children();
            }
            return Some(ReadEvent::Stanza(Stanza::from_full_element(element)));
        }
        if let Some(parent) = self.path.last_mut() {
            parent.push_node(Node::Element(element));
        }
        None
    }

    fn append(&mut self, node: Node) -> Result<Option<ReadEvent>, SessionError> {
        match self.path.last_mut() {
            Some(parent) => {
                parent.push_node(node);
                Ok(None)
            }
            None => Err(SessionError::Malformed(
                "character data outside the root element".to_string(),
            )),
        }
    }
}
