//! Minimal mutable XML tree for libvirt documents.
//!
//! Domain and volume documents are parsed into an [`Element`] tree with
//! quick-xml, edited locally and serialized back. Whitespace and comments
//! inside the root element are kept, so an untouched document serializes to
//! an equivalent document.

use std::borrow::Cow;

use quick_xml::events::{BytesCData, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{HypervisorError, Result};

/// A node inside an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
}

/// An XML element with its attributes (in document order) and children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

fn xml_error(e: impl std::fmt::Display) -> HypervisorError {
    HypervisorError::InvalidInput(format!("Malformed XML document: {}", e))
}

impl Element {
    /// Create an empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder: set an attribute.
    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Builder: append a child element.
    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    /// Builder: set the text content.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.set_text(text);
        self
    }

    // =========================================================================
    // Parsing and serialization
    // =========================================================================

    /// Parse a document and return its root element.
    pub fn parse(xml: &str) -> Result<Element> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(false);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(start) => {
                    stack.push(Self::from_start(&start)?);
                }
                Event::Empty(start) => {
                    let element = Self::from_start(&start)?;
                    Self::attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| xml_error("unexpected closing tag"))?;
                    Self::attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(xml_error)?.into_owned();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(text));
                    }
                }
                Event::CData(data) => {
                    let data = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::CData(data));
                    }
                }
                Event::Comment(comment) => {
                    let comment = String::from_utf8_lossy(&comment).into_owned();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Comment(comment));
                    }
                }
                Event::Eof => break,
                // Declarations, processing instructions and doctypes are dropped.
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(xml_error("unclosed element"));
        }

        root.ok_or_else(|| xml_error("document has no root element"))
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Element> {
        let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()));
        for attr in start.attributes() {
            let attr = attr.map_err(xml_error)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(xml_error)?.into_owned();
            element.attributes.push((key, value));
        }
        Ok(element)
    }

    fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
        match stack.last_mut() {
            Some(parent) => parent.children.push(Node::Element(element)),
            None if root.is_none() => *root = Some(element),
            None => return Err(xml_error("document has more than one root element")),
        }
        Ok(())
    }

    /// Serialize this element (and its subtree) to a string.
    pub fn to_xml_string(&self) -> Result<String> {
        let mut writer = Writer::new(Vec::new());
        self.write_to(&mut writer)?;
        String::from_utf8(writer.into_inner())
            .map_err(|e| HypervisorError::Internal(format!("Serialized XML is not UTF-8: {}", e)))
    }

    fn write_to(&self, writer: &mut Writer<Vec<u8>>) -> Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        if self.children.is_empty() {
            writer.write_event(Event::Empty(start)).map_err(xml_error)?;
            return Ok(());
        }

        writer.write_event(Event::Start(start)).map_err(xml_error)?;
        for child in &self.children {
            match child {
                Node::Element(element) => element.write_to(writer)?,
                Node::Text(text) => writer
                    .write_event(Event::Text(BytesText::new(text)))
                    .map_err(xml_error)?,
                Node::CData(data) => writer
                    .write_event(Event::CData(BytesCData::new(data.as_str())))
                    .map_err(xml_error)?,
                Node::Comment(comment) => writer
                    .write_event(Event::Comment(BytesText::from_escaped(comment.as_str())))
                    .map_err(xml_error)?,
            }
        }
        writer
            .write_event(Event::End(BytesEnd::new(self.name.as_str())))
            .map_err(xml_error)?;
        Ok(())
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.attr(key).is_some()
    }

    /// Set an attribute, replacing its value in place if it already exists.
    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.attributes.push((key.to_string(), value)),
        }
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let index = self.attributes.iter().position(|(k, _)| k == key)?;
        Some(self.attributes.remove(index).1)
    }

    // =========================================================================
    // Text
    // =========================================================================

    /// Concatenated text content, or `None` if the element has no text.
    pub fn text(&self) -> Option<Cow<'_, str>> {
        let mut parts = self.children.iter().filter_map(|child| match child {
            Node::Text(text) | Node::CData(text) => Some(text.as_str()),
            _ => None,
        });

        let first = parts.next()?;
        match parts.next() {
            None => Some(Cow::Borrowed(first)),
            Some(second) => {
                let mut joined = format!("{}{}", first, second);
                parts.for_each(|part| joined.push_str(part));
                Some(Cow::Owned(joined))
            }
        }
    }

    /// Replace all text content with `text`.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children
            .retain(|child| !matches!(child, Node::Text(_) | Node::CData(_)));
        self.children.insert(0, Node::Text(text.into()));
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Direct child elements.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|child| match child {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    /// First direct child element named `name`.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|element| element.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find_map(|child| match child {
            Node::Element(element) if element.name == name => Some(element),
            _ => None,
        })
    }

    /// First element matching a slash-separated path relative to this one,
    /// e.g. `"target/format"`.
    pub fn find(&self, path: &str) -> Option<&Element> {
        self.find_all(path).into_iter().next()
    }

    /// All elements matching a slash-separated path, in document order.
    pub fn find_all(&self, path: &str) -> Vec<&Element> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut found = Vec::new();
        collect(self, &segments, &mut found);
        found
    }

    pub fn find_all_mut(&mut self, path: &str) -> Vec<&mut Element> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut found = Vec::new();
        collect_mut(self, &segments, &mut found);
        found
    }

    /// Remove every direct child element named `name`. Returns how many were
    /// removed.
    pub fn remove_children(&mut self, name: &str) -> usize {
        let before = self.children.len();
        self.children
            .retain(|child| !matches!(child, Node::Element(element) if element.name == name));
        before - self.children.len()
    }
}

fn collect<'a>(element: &'a Element, segments: &[&str], found: &mut Vec<&'a Element>) {
    match segments.split_first() {
        None => found.push(element),
        Some((head, rest)) => {
            for child in element.elements().filter(|child| child.name == *head) {
                collect(child, rest, found);
            }
        }
    }
}

fn collect_mut<'a>(element: &'a mut Element, segments: &[&str], found: &mut Vec<&'a mut Element>) {
    match segments.split_first() {
        None => found.push(element),
        Some((head, rest)) => {
            for child in element.children.iter_mut() {
                if let Node::Element(child) = child {
                    if child.name == *head {
                        collect_mut(child, rest, found);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<domain type="kvm">
  <name>vm1</name>
  <devices>
    <interface type="network">
      <mac address="52:54:00:4c:4e:25"/>
      <target dev="vnet0"/>
    </interface>
    <interface type="network">
      <mac address="52:54:00:00:00:01"/>
    </interface>
  </devices>
</domain>"#;

    #[test]
    fn test_parse_and_navigate() {
        let root = Element::parse(DOC).unwrap();
        assert_eq!(root.name, "domain");
        assert_eq!(root.attr("type"), Some("kvm"));
        assert_eq!(root.child("name").unwrap().text().unwrap(), "vm1");

        let macs = root.find_all("devices/interface/mac");
        assert_eq!(macs.len(), 2);
        assert_eq!(macs[1].attr("address"), Some("52:54:00:00:00:01"));
        assert!(root.find("devices/disk").is_none());
    }

    #[test]
    fn test_untouched_document_survives_serialization() {
        let root = Element::parse(DOC).unwrap();
        let serialized = root.to_xml_string().unwrap();
        assert_eq!(Element::parse(&serialized).unwrap(), root);
    }

    #[test]
    fn test_mutation() {
        let mut root = Element::parse(DOC).unwrap();

        for mac in root.find_all_mut("devices/interface/mac") {
            mac.set_attr("address", "aa:bb:cc:dd:ee:ff");
        }
        for iface in root.find_all_mut("devices/interface") {
            iface.remove_children("target");
        }
        root.child_mut("name").unwrap().set_text("clone & co");

        let reparsed = Element::parse(&root.to_xml_string().unwrap()).unwrap();
        assert!(reparsed.find("devices/interface/target").is_none());
        assert!(reparsed
            .find_all("devices/interface/mac")
            .iter()
            .all(|mac| mac.attr("address") == Some("aa:bb:cc:dd:ee:ff")));
        assert_eq!(reparsed.child("name").unwrap().text().unwrap(), "clone & co");
    }

    #[test]
    fn test_attribute_order_is_kept() {
        let mut element = Element::new("graphics")
            .with_attr("type", "vnc")
            .with_attr("port", "5900");
        element.set_attr("type", "spice");
        element.set_attr("autoport", "yes");
        assert_eq!(element.remove_attr("port"), Some("5900".to_string()));
        assert_eq!(
            element.to_xml_string().unwrap(),
            r#"<graphics type="spice" autoport="yes"/>"#
        );
    }

    #[test]
    fn test_malformed_documents_are_rejected() {
        assert!(matches!(
            Element::parse("<domain><name>vm</domain>"),
            Err(HypervisorError::InvalidInput(_))
        ));
        assert!(matches!(Element::parse(""), Err(HypervisorError::InvalidInput(_))));
        assert!(matches!(
            Element::parse("<a/><b/>"),
            Err(HypervisorError::InvalidInput(_))
        ));
    }
}
