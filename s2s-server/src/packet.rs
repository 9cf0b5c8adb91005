//! Stanza view over an [`Element`] with addressing helpers.

use std::fmt;

use crate::xml::{ns, Element};

/// A top-level element received from or destined to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    element: Element,
}

/// Domain part of a JID (`user@domain/resource` → `domain`).
pub fn jid_domain(jid: &str) -> &str {
    let bare = jid.split_once('/').map(|(b, _)| b).unwrap_or(jid);
    let domain = bare.rsplit_once('@').map(|(_, d)| d).unwrap_or(bare);
    domain.trim()
}

impl Packet {
    pub fn new(element: Element) -> Self {
        Self { element }
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    pub fn name(&self) -> &str {
        self.element.local_name()
    }

    pub fn xmlns(&self) -> Option<&str> {
        self.element.ns()
    }

    pub fn is(&self, local_name: &str, ns: &str) -> bool {
        self.element.is(local_name, ns)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.element.attr(key)
    }

    pub fn stanza_from(&self) -> Option<&str> {
        self.attr("from")
    }

    pub fn stanza_to(&self) -> Option<&str> {
        self.attr("to")
    }

    /// Domain of `from`; `None` when missing or blank.
    pub fn from_domain(&self) -> Option<&str> {
        self.stanza_from().map(jid_domain).filter(|d| !d.is_empty())
    }

    /// Domain of `to`; `None` when missing or blank.
    pub fn to_domain(&self) -> Option<&str> {
        self.stanza_to().map(jid_domain).filter(|d| !d.is_empty())
    }

    pub fn stanza_type(&self) -> Option<&str> {
        self.attr("type")
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    /// `<stream:features>`.
    pub fn is_features(&self) -> bool {
        self.is("features", ns::STREAMS)
    }

    /// Stanza in the server or client namespace (message, presence, iq).
    pub fn is_routable(&self) -> bool {
        matches!(self.xmlns(), Some(ns::SERVER) | Some(ns::CLIENT))
    }

    pub fn to_xml(&self) -> String {
        self.element.to_xml()
    }
}

impl From<Element> for Packet {
    fn from(element: Element) -> Self {
        Packet::new(element)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.element.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_extraction() {
        assert_eq!(jid_domain("user@example.com/res"), "example.com");
        assert_eq!(jid_domain("example.com"), "example.com");
        assert_eq!(jid_domain("example.com/a@b"), "example.com");
        assert_eq!(jid_domain(" "), "");
    }

    #[test]
    fn blank_addresses_are_none() {
        let p = Packet::new(Element::new("message").with_attr("from", " ").with_attr("to", "u@b.test"));
        assert_eq!(p.from_domain(), None);
        assert_eq!(p.to_domain(), Some("b.test"));
    }
}
