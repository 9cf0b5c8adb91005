//! XML plumbing: an owned element tree plus stream framing.

pub mod element;
pub mod framing;

pub use element::Element;
pub use framing::{Frame, StreamFramer, StreamHeader};

/// Namespaces the S2S core produces or inspects.
pub mod ns {
    pub const SERVER: &str = "jabber:server";
    pub const CLIENT: &str = "jabber:client";
    pub const STREAMS: &str = "http://etherx.jabber.org/streams";
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    pub const STANZA_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const DIALBACK: &str = "jabber:server:dialback";
    pub const DIALBACK_FEATURES: &str = "urn:xmpp:features:dialback";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const COMPRESS: &str = "http://jabber.org/protocol/compress";
}
