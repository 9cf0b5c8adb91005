//! Minimal owned XML element tree used for stanzas and stream-level elements.

use std::borrow::Cow;
use std::fmt;

/// An XML element with its resolved namespace.
///
/// `name` is the qualified name as written on the wire (`db:result`,
/// `stream:features`, `message`). `ns` is the namespace the name resolves
/// to, which may come from an inherited default or a prefix declared on the
/// stream header rather than from an attribute on this element.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    name: String,
    ns: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    /// Element with no namespace information; it inherits whatever default
    /// namespace is in scope where it gets written.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Element carrying an explicit `xmlns` attribute.
    pub fn with_ns(name: impl Into<String>, ns: impl Into<String>) -> Self {
        let ns = ns.into();
        Self {
            name: name.into(),
            attrs: vec![("xmlns".to_string(), ns.clone())],
            ns: Some(ns),
            ..Default::default()
        }
    }

    /// Prefixed element whose prefix is declared on the stream header
    /// (`db:result`, `stream:error`). No `xmlns` attribute is written.
    pub fn prefixed(name: impl Into<String>, ns: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ns: Some(ns.into()),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name without its prefix.
    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn ns(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    pub(crate) fn set_ns(&mut self, ns: Option<String>) {
        self.ns = ns;
    }

    pub fn is(&self, local_name: &str, ns: &str) -> bool {
        self.local_name() == local_name && self.ns() == Some(ns)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let idx = self.attrs.iter().position(|(k, _)| k == key)?;
        Some(self.attrs.remove(idx).1)
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(child);
    }

    /// First child with the given local name and namespace.
    pub fn child(&self, local_name: &str, ns: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(local_name, ns))
    }

    pub fn has_child(&self, local_name: &str, ns: &str) -> bool {
        self.child(local_name, ns).is_some()
    }

    /// First child with the given local name in any namespace.
    pub fn child_named(&self, local_name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.local_name() == local_name)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn push_text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("='");
            out.push_str(&escape(v));
            out.push('\'');
        }
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(&self.text));
        for child in &self.children {
            child.write_to(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

/// Escape text for use in character data or a single-quoted attribute.
pub fn escape(s: &str) -> Cow<'_, str> {
    if !s.contains(['&', '<', '>', '\'', '"']) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_single_quotes() {
        let el = Element::with_ns("starttls", "urn:ietf:params:xml:ns:xmpp-tls");
        assert_eq!(el.to_xml(), "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
    }

    #[test]
    fn prefixed_elements_do_not_write_xmlns() {
        let el = Element::prefixed("db:result", "jabber:server:dialback")
            .with_attr("from", "a.test")
            .with_attr("to", "b.test")
            .with_text("abc");
        assert_eq!(el.to_xml(), "<db:result from='a.test' to='b.test'>abc</db:result>");
        assert!(el.is("result", "jabber:server:dialback"));
        assert_eq!(el.local_name(), "result");
    }

    #[test]
    fn escapes_text_and_attributes() {
        let el = Element::new("body").with_attr("x", "it's").with_text("a<b&c");
        assert_eq!(el.to_xml(), "<body x='it&apos;s'>a&lt;b&amp;c</body>");
    }

    #[test]
    fn set_attr_replaces_existing_value() {
        let mut el = Element::new("db:result").with_attr("type", "valid");
        el.set_attr("type", "invalid");
        assert_eq!(el.attr("type"), Some("invalid"));
        assert_eq!(el.attrs().count(), 1);
        assert_eq!(el.remove_attr("type").as_deref(), Some("invalid"));
        assert_eq!(el.attr("type"), None);
    }

    #[test]
    fn child_lookup_respects_namespace() {
        let el = Element::new("stream:features")
            .with_child(Element::with_ns("starttls", "urn:ietf:params:xml:ns:xmpp-tls"));
        assert!(el.has_child("starttls", "urn:ietf:params:xml:ns:xmpp-tls"));
        assert!(!el.has_child("starttls", "jabber:server"));
        assert!(el.child_named("starttls").is_some());
    }
}
