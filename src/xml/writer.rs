//! Serializes stanzas into one outgoing XML document.

use crate::error::SessionError;
use crate::stanza::Stanza;
use crate::xml::{Element, Node};
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Write;

/// Tracks the state of the document being written: whether the XML declaration went
/// out, which roots were opened by opening-tag-only stanzas, and whether the document
/// has been finalized.
#[derive(Debug, Default)]
pub struct DocumentWriter {
    declared: bool,
    open: Vec<String>,
    finished: bool,
}

impl DocumentWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the current document; the next stanza starts a new one.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of roots currently left open.
    pub fn open_roots(&self) -> usize {
        self.open.len()
    }

    /// Append the serialized `stanza` to `out`.
    pub fn write_stanza(&mut self, stanza: &Stanza, out: &mut Vec<u8>) -> Result<(), SessionError> {
        if self.finished {
            return Err(SessionError::WriterClosed);
        }
        let mut writer = Writer::new(out);
        if !self.declared {
            emit(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
            self.declared = true;
        }
        let element = stanza.element();
        if stanza.is_opening_tag_only() {
            write_open(&mut writer, element)?;
            self.open.push(element.name().to_string());
        } else {
            write_element(&mut writer, element)?;
        }
        Ok(())
    }

    /// Close every open root, innermost first. Later writes fail with `WriterClosed`.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), SessionError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let mut writer = Writer::new(out);
        while let Some(name) = self.open.pop() {
            emit(&mut writer, Event::End(BytesEnd::new(name)))?;
        }
        Ok(())
    }
}

fn emit<W: Write>(writer: &mut Writer<W>, event: Event<'_>) -> Result<(), SessionError> {
    writer
        .write_event(event)
        .map_err(|e| SessionError::Serialize(e.to_string()))
}

fn start_tag(element: &Element) -> BytesStart<'_> {
    let mut start = BytesStart::new(element.name());
    for attr in element.attributes() {
        start.push_attribute((attr.name.as_str(), attr.value.as_str()));
    }
    start
}

/// Start tag plus children, leaving the element open.
fn write_open<W: Write>(writer: &mut Writer<W>, element: &Element) -> Result<(), SessionError> {
    emit(writer, Event::Start(start_tag(element)))?;
    for child in element.children() {
        write_node(writer, child)?;
    }
    Ok(())
}

fn write_element<W: Write>(writer: &mut Writer<W>, element: &Element) -> Result<(), SessionError> {
    if element.children().is_empty() {
        return emit(writer, Event::Empty(start_tag(element)));
    }
    write_open(writer, element)?;
    emit(writer, Event::End(BytesEnd::new(element.name())))
}

fn write_node<W: Write>(writer: &mut Writer<W>, node: &Node) -> Result<(), SessionError> {
    match node {
        Node::Element(child) => write_element(writer, child),
        Node::Text(text) => emit(writer, Event::Text(BytesText::new(text))),
        Node::CData(data) if data.contains("]]>") => emit(writer, Event::Text(BytesText::new(data))),
        Node::CData(data) => emit(writer, Event::CData(BytesCData::new(data.as_str()))),
        Node::Comment(comment) if comment.contains("--") || comment.ends_with('-') => Ok(()),
        Node::Comment(comment) => emit(writer, Event::Comment(BytesText::from_escaped(comment.as_str()))),
    }
}
