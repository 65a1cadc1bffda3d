//! Generic XML element used for every stanza, feature and stored payload.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An XML element with ordered attributes, child elements and text content.
///
/// Namespaces are carried as plain `xmlns` attributes, the way they appear
/// on the wire. Mixed content is not modelled: text of a node is the
/// concatenation of its character data.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Element with an `xmlns` attribute.
    pub fn with_ns(name: impl Into<String>, ns: impl Into<String>) -> Self {
        Self::new(name).attr("xmlns", ns)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Builder: sets an attribute.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Builder: sets an attribute only when the value is non-empty.
    pub fn attr_opt(self, key: impl Into<String>, value: &str) -> Self {
        if value.is_empty() {
            self
        } else {
            self.attr(key, value)
        }
    }

    /// Builder: appends a child.
    pub fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// Builder: appends several children.
    pub fn children_from(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.children.extend(children);
        self
    }

    /// Builder: sets text content.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute value or the empty string.
    pub fn attr_str(&self, key: &str) -> &str {
        self.get_attr(key).unwrap_or("")
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    pub fn remove_attr(&mut self, key: &str) {
        self.attrs.retain(|(k, _)| k != key);
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Value of the `xmlns` attribute, empty when absent.
    pub fn namespace(&self) -> &str {
        self.attr_str("xmlns")
    }

    pub fn id(&self) -> &str {
        self.attr_str("id")
    }

    pub fn type_attr(&self) -> &str {
        self.attr_str("type")
    }

    pub fn get_text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub(crate) fn append_text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub fn elements(&self) -> &[Element] {
        &self.children
    }

    pub fn append(&mut self, child: Element) {
        self.children.push(child);
    }

    /// First child with the given name.
    pub fn find(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First child with the given name and namespace.
    pub fn find_ns(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children
            .iter()
            .find(|c| c.name == name && c.namespace() == ns)
    }

    /// First child declaring the given namespace, whatever its name.
    pub fn find_any_ns(&self, ns: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.namespace() == ns)
    }

    pub fn find_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn remove_children(&mut self, name: &str) {
        self.children.retain(|c| c.name != name);
    }

    pub fn remove_children_ns(&mut self, name: &str, ns: &str) {
        self.children
            .retain(|c| !(c.name == name && c.namespace() == ns));
    }

    /// Canonical serialization.
    pub fn to_xml(&self) -> String {
        let mut out = String::with_capacity(128);
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        self.write_open_tag(out);
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        escape_text(&self.text, out);
        for child in &self.children {
            child.write_xml(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Opening tag only (`<name a="b">`), used for stream roots.
    pub fn to_open_tag(&self) -> String {
        let mut out = String::with_capacity(128);
        self.write_open_tag(&mut out);
        out.push('>');
        out
    }

    fn write_open_tag(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            escape_attr(v, out);
            out.push('"');
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

fn escape_text(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn escape_attr(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_serialize() {
        let elem = Element::new("iq")
            .attr("id", "r1")
            .attr("type", "set")
            .child(
                Element::with_ns("query", "jabber:iq:roster").child(
                    Element::new("item")
                        .attr("jid", "noelia@jackal.im")
                        .attr("name", "My Juliet"),
                ),
            );
        assert_eq!(
            elem.to_xml(),
            r#"<iq id="r1" type="set"><query xmlns="jabber:iq:roster"><item jid="noelia@jackal.im" name="My Juliet"/></query></iq>"#
        );
    }

    #[test]
    fn test_escaping() {
        let elem = Element::new("body").attr("a", "x\"<y>'").text("a & b <c>");
        assert_eq!(
            elem.to_xml(),
            r#"<body a="x&quot;&lt;y&gt;&apos;">a &amp; b &lt;c&gt;</body>"#
        );
    }

    #[test]
    fn test_lookups() {
        let elem = Element::new("iq")
            .child(Element::with_ns("bind", "urn:ietf:params:xml:ns:xmpp-bind"))
            .child(Element::new("item"))
            .child(Element::new("item"));
        assert!(elem.find("bind").is_some());
        assert!(elem
            .find_ns("bind", "urn:ietf:params:xml:ns:xmpp-bind")
            .is_some());
        assert!(elem.find_ns("bind", "jabber:client").is_none());
        assert_eq!(elem.find_all("item").count(), 2);
    }

    #[test]
    fn test_set_attr_replaces() {
        let mut elem = Element::new("presence").attr("to", "a@b");
        elem.set_attr("to", "c@d");
        assert_eq!(elem.attrs().count(), 1);
        assert_eq!(elem.attr_str("to"), "c@d");
        elem.remove_attr("to");
        assert!(elem.get_attr("to").is_none());
    }

    #[test]
    fn test_open_tag() {
        let elem = Element::new("stream:stream").attr("version", "1.0");
        assert_eq!(elem.to_open_tag(), r#"<stream:stream version="1.0">"#);
    }
}
