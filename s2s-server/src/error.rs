//! Error types for the federation engine.

use std::fmt;

/// Errors raised by the S2S core.
#[derive(Debug, thiserror::Error)]
pub enum S2sError {
    /// The local side of a CID is not a domain served by this server.
    #[error("{0} is not a local domain")]
    NotLocalhost(String),
    /// The remote side of a CID is one of our own domains.
    #[error("{0} is a local domain")]
    Localhost(String),
    #[error("connection has no CID bound")]
    MissingCid,
    #[error("stanza has no from/to domain")]
    Unaddressed,
    #[error("stream has no id yet")]
    MissingStreamId,
    #[error("no dialback secret available for {0}")]
    MissingSecret(String),
    #[error("XML error: {0}")]
    Xml(String),
    #[error("stanza exceeds {0} bytes")]
    StanzaTooLarge(usize),
    #[error("key derivation failed: {0}")]
    Crypto(String),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("{0} authentication is not available")]
    MethodUnavailable(&'static str),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl S2sError {
    /// Stream error condition a peer should see when this error ends a stream.
    pub fn stream_condition(&self) -> StreamErrorCondition {
        match self {
            S2sError::NotLocalhost(_) => StreamErrorCondition::HostUnknown,
            S2sError::Localhost(_) => StreamErrorCondition::InvalidFrom,
            S2sError::Unaddressed => StreamErrorCondition::ImproperAddressing,
            S2sError::Xml(_) => StreamErrorCondition::NotWellFormed,
            S2sError::StanzaTooLarge(_) => StreamErrorCondition::PolicyViolation,
            _ => StreamErrorCondition::InternalServerError,
        }
    }
}

impl From<quick_xml::Error> for S2sError {
    fn from(e: quick_xml::Error) -> Self {
        S2sError::Xml(e.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for S2sError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        S2sError::Xml(e.to_string())
    }
}

/// Defined conditions from `urn:ietf:params:xml:ns:xmpp-streams` used here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    ImproperAddressing,
    InvalidNamespace,
    HostUnknown,
    InvalidFrom,
    PolicyViolation,
    InternalServerError,
    NotWellFormed,
    NotAuthorized,
    InvalidId,
}

impl StreamErrorCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImproperAddressing => "improper-addressing",
            Self::InvalidNamespace => "invalid-namespace",
            Self::HostUnknown => "host-unknown",
            Self::InvalidFrom => "invalid-from",
            Self::PolicyViolation => "policy-violation",
            Self::InternalServerError => "internal-server-error",
            Self::NotWellFormed => "not-well-formed",
            Self::NotAuthorized => "not-authorized",
            Self::InvalidId => "invalid-id",
        }
    }
}

impl fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
