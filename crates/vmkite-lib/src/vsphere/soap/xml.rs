//! Minimal element tree over quick-xml for reading SOAP responses

use super::super::{Fault, ManagedObjectReference};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// An XML element with namespace prefixes stripped from its name.
///
/// Attribute keys keep their prefix so `xsi:type` and `type` stay distinct.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Descend through nested children by name
    pub fn find(&self, path: &[&str]) -> Option<&Element> {
        path.iter().try_fold(self, |element, name| element.child(name))
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// `xsi:type` without its namespace prefix
    pub fn xsi_type(&self) -> Option<&str> {
        self.attr("xsi:type")
            .map(|t| t.rsplit(':').next().unwrap_or(t))
    }

    pub fn text(&self) -> &str {
        self.text.as_str()
    }

    /// Read a `<x type="Kind">value</x>` managed object reference
    pub fn moref(&self) -> Option<ManagedObjectReference> {
        let kind = self.attr("type")?;
        if self.text.is_empty() {
            return None;
        }
        Some(ManagedObjectReference::new(kind, self.text.clone()))
    }
}

fn malformed(detail: impl std::fmt::Display) -> Fault {
    Fault::Transport(format!("malformed XML response: {}", detail))
}

fn open(start: &BytesStart<'_>) -> Result<Element, Fault> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(malformed)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(malformed)?.into_owned();
        attributes.push((key, value));
    }
    Ok(Element {
        name,
        attributes,
        ..Element::default()
    })
}

/// Parse a document into its root element
pub(crate) fn parse(xml: &str) -> Result<Element, Fault> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut stack: Vec<Element> = Vec::new();

    loop {
        let closed = match reader.read_event().map_err(malformed)? {
            Event::Start(start) => {
                stack.push(open(&start)?);
                None
            }
            Event::Empty(start) => Some(open(&start)?),
            Event::End(_) => Some(stack.pop().ok_or_else(|| malformed("unbalanced end tag"))?),
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text.unescape().map_err(malformed)?);
                }
                None
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
                None
            }
            Event::Eof => return Err(malformed("document ended before the root element closed")),
            _ => None,
        };

        if let Some(element) = closed {
            match stack.last_mut() {
                Some(parent) => parent.children.push(element),
                None => return Ok(element),
            }
        }
    }
}
