//! Owned XML element tree.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

/// A child of an [`Element`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
}

/// An element with its qualified name, attributes and children.
///
/// `namespace` is the URI resolved when the element was parsed. Elements built in code
/// leave it unset and answer [`Element::namespace`] from their own `xmlns` declarations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Element {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<Attribute>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Shorthand for an element carrying a default namespace declaration.
    pub fn with_ns(name: impl Into<String>, namespace: &str) -> Self {
        Self::new(name).with_attr("xmlns", namespace)
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.children.push(node);
        self
    }

    pub fn push_node(&mut self, node: Node) {
        self.children.push(node);
    }

    /// Set or replace an attribute.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|a| a.name == name) {
            Some(existing) => existing.value = value,
            None => self.attributes.push(Attribute { name, value }),
        }
    }

    /// Qualified name as written, e.g. `stream:features`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace
            .as_deref()
            .or_else(|| self.declared_namespace(self.prefix()))
    }

    pub(crate) fn set_namespace(&mut self, namespace: Option<String>) {
        self.namespace = namespace;
    }

    /// The namespace this element's own attributes bind to `prefix`.
    pub fn declared_namespace(&self, prefix: Option<&str>) -> Option<&str> {
        match prefix {
            None => self.attr("xmlns"),
            Some(prefix) => self
                .attributes
                .iter()
                .find(|a| a.name.strip_prefix("xmlns:") == Some(prefix))
                .map(|a| a.value.as_str()),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub(crate) fn clear_children(&mut self) {
        self.children.clear();
    }

    /// Child elements, skipping text and comments.
    pub fn elements(&self) -> impl Iterator<Item = &Element> + '_ {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    /// Whether this element has the given local name and (when given) namespace.
    pub fn is(&self, local_name: &str, namespace: Option<&str>) -> bool {
        self.local_name() == local_name && (namespace.is_none() || self.namespace() == namespace)
    }

    /// First child element matching [`Element::is`].
    pub fn find(&self, local_name: &str, namespace: Option<&str>) -> Option<&Element> {
        self.elements().find(|e| e.is(local_name, namespace))
    }

    /// Concatenated direct text and CDATA content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) | Node::CData(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }
}
