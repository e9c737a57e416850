//! Stanza contract exchanged between the session and its connection handler.

use crate::xml::Element;
use serde::{Deserialize, Serialize};

/// One unit of the stream: a complete element, or the opening tag of a document root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stanza {
    #[serde(rename = "e")]
    element: Element,
    #[serde(rename = "ot", default)]
    opening_tag_only: bool,
}

impl Stanza {
    /// A root element whose content follows later in the stream.
    pub fn from_opening_tag(element: Element) -> Self {
        Self {
            element,
            opening_tag_only: true,
        }
    }

    pub fn from_full_element(element: Element) -> Self {
        Self {
            element,
            opening_tag_only: false,
        }
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    pub fn is_opening_tag_only(&self) -> bool {
        self.opening_tag_only
    }
}

/// What the session does after a handler returns.
///
/// Values are ordered: anything from [`StreamAction::Reset`] upwards restarts the document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StreamAction {
    #[default]
    #[serde(rename = "go")]
    Continue = 0,
    #[serde(rename = "close")]
    Close = 1,
    #[serde(rename = "abort")]
    Abort = 2,
    #[serde(rename = "reset")]
    Reset = 3,
    #[serde(rename = "tls")]
    StartTls = 101,
}

impl StreamAction {
    pub fn restarts_stream(self) -> bool {
        self >= StreamAction::Reset
    }
}

/// A handler's reply: an optional stanza to write, then an action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StanzaResult {
    #[serde(rename = "a", default)]
    action: StreamAction,
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    response: Option<Stanza>,
}

impl StanzaResult {
    pub fn new(action: StreamAction, response: Option<Stanza>) -> Self {
        Self { action, response }
    }

    /// Write `response` and keep going.
    pub fn respond(response: Stanza) -> Self {
        Self::new(StreamAction::Continue, Some(response))
    }

    pub fn action(action: StreamAction) -> Self {
        Self::new(action, None)
    }

    pub fn stream_action(&self) -> StreamAction {
        self.action
    }

    pub fn response(&self) -> Option<&Stanza> {
        self.response.as_ref()
    }

    pub fn into_parts(self) -> (StreamAction, Option<Stanza>) {
        (self.action, self.response)
    }
}
