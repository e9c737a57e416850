//! Streaming XML: element model, incremental stanza reader and document writer.

pub mod element;
pub mod reader;
pub mod writer;

pub use element::{Attribute, Element, Node};
pub use reader::{ReadEvent, StanzaReader};
pub use writer::DocumentWriter;

/// Well-known namespaces.
pub mod ns {
    pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
    pub const STREAMS: &str = "http://etherx.jabber.org/streams";
    pub const CLIENT: &str = "jabber:client";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
}
