//! Stream framing: cut a TCP byte stream into stream headers, complete
//! top-level stanzas and the closing tag, then parse stanzas into
//! [`Element`]s with namespaces resolved against the stream header.

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::element::{escape, Element};
use super::ns;
use crate::error::S2sError;

/// Upper bound on buffered, not yet framed input.
pub const MAX_FRAME_SIZE: usize = 512 * 1024;

/// One unit of stream input.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `<stream:stream ...>` opened (or reopened) by the peer.
    Open(StreamHeader),
    /// A complete top-level element.
    Stanza(Element),
    /// `</stream:stream>`.
    Close,
}

/// Attributes of a `<stream:stream>` opening tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    attrs: Vec<(String, String)>,
}

impl StreamHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    /// Parse the opening tag (an XML declaration in front is skipped).
    pub fn parse(raw: &str) -> Result<Self, S2sError> {
        let mut reader = Reader::from_str(raw);
        reader.config_mut().check_end_names = false;
        loop {
            match reader.read_event()? {
                Event::Start(e) | Event::Empty(e) => {
                    return Ok(Self {
                        attrs: collect_attrs(&e)?,
                    });
                }
                Event::Eof => return Err(S2sError::Xml("missing stream header".into())),
                _ => continue,
            }
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    pub fn from(&self) -> Option<&str> {
        self.attr("from")
    }

    pub fn to(&self) -> Option<&str> {
        self.attr("to")
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn version(&self) -> Option<&str> {
        self.attr("version")
    }

    fn default_ns(&self) -> &str {
        self.attr("xmlns").unwrap_or(ns::SERVER)
    }

    fn prefixes(&self) -> Vec<(String, String)> {
        let mut prefixes: Vec<(String, String)> = self
            .attrs
            .iter()
            .filter_map(|(k, v)| k.strip_prefix("xmlns:").map(|p| (p.to_string(), v.clone())))
            .collect();
        // Peers occasionally rely on these without declaring them.
        for (p, uri) in [("stream", ns::STREAMS), ("db", ns::DIALBACK)] {
            if !prefixes.iter().any(|(k, _)| k == p) {
                prefixes.push((p.to_string(), uri.to_string()));
            }
        }
        prefixes
    }
}

/// Render the `<stream:stream>` opening tag this server sends.
pub fn stream_open_xml(
    from: Option<&str>,
    to: Option<&str>,
    id: Option<&str>,
    version: Option<&str>,
) -> String {
    let mut out = format!(
        "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' xmlns:db='{}'",
        ns::SERVER,
        ns::STREAMS,
        ns::DIALBACK
    );
    for (key, value) in [("from", from), ("to", to), ("id", id), ("version", version)] {
        if let Some(value) = value {
            out.push_str(&format!(" {key}='{}'", escape(value)));
        }
    }
    out.push('>');
    out
}

/// Incremental framer for one direction of one connection.
#[derive(Debug)]
pub struct StreamFramer {
    buf: Vec<u8>,
    default_ns: String,
    prefixes: Vec<(String, String)>,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            default_ns: ns::SERVER.to_string(),
            prefixes: StreamHeader::new().prefixes(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<(), S2sError> {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_FRAME_SIZE {
            return Err(S2sError::StanzaTooLarge(MAX_FRAME_SIZE));
        }
        Ok(())
    }

    /// Drop buffered input; used when the byte stream is replaced (TLS).
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, S2sError> {
        loop {
            let Some((raw, consumed)) = extract_frame(&self.buf)? else {
                return Ok(None);
            };
            self.buf.drain(..consumed);
            match raw {
                RawFrame::Skip => continue,
                RawFrame::Close => return Ok(Some(Frame::Close)),
                RawFrame::Open(text) => {
                    let header = StreamHeader::parse(&text)?;
                    self.default_ns = header.default_ns().to_string();
                    self.prefixes = header.prefixes();
                    return Ok(Some(Frame::Open(header)));
                }
                RawFrame::Stanza(text) => {
                    let element = parse_element(&text, &self.default_ns, &self.prefixes)?;
                    return Ok(Some(Frame::Stanza(element)));
                }
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum RawFrame {
    Open(String),
    Stanza(String),
    Close,
    /// Whitespace keepalives, declarations and other top-level noise.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Idle,
    InStanza,
}

fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn is_stream_tag(name: &[u8]) -> bool {
    name == b"stream:stream" || name == b"stream"
}

/// Find the next frame boundary in `buffer`.
///
/// Returns the raw frame and the number of bytes it consumed, or `None`
/// when more input is needed.
fn extract_frame(buffer: &[u8]) -> Result<Option<(RawFrame, usize)>, S2sError> {
    let Some(start) = buffer.iter().position(|b| !b.is_ascii_whitespace()) else {
        return Ok((!buffer.is_empty()).then_some((RawFrame::Skip, buffer.len())));
    };
    if buffer[start..].starts_with(b"</stream:stream>") {
        return Ok(Some((RawFrame::Close, start + b"</stream:stream>".len())));
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut stanza_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_))
                if state == ParserState::Idle =>
            {
                return Ok(Some((RawFrame::Skip, reader.buffer_position() as usize)));
            }
            Ok(Event::Start(e)) => {
                if state == ParserState::Idle && is_stream_tag(e.name().as_ref()) {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((RawFrame::Open(bytes_to_string(&buffer[pos..end])), end)));
                }
                depth += 1;
                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InStanza;
                    stanza_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                if state == ParserState::Idle {
                    let end = reader.buffer_position() as usize;
                    let text = bytes_to_string(&buffer[pos..end]);
                    if is_stream_tag(e.name().as_ref()) {
                        return Ok(Some((RawFrame::Open(text), end)));
                    }
                    return Ok(Some((RawFrame::Stanza(text), end)));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {
                if state == ParserState::Idle {
                    return Ok(Some((RawFrame::Skip, reader.buffer_position() as usize)));
                }
            }
            Ok(Event::End(e)) => {
                if depth == 0 && is_stream_tag(e.name().as_ref()) {
                    return Ok(Some((RawFrame::Close, reader.buffer_position() as usize)));
                }
                depth = depth.saturating_sub(1);
                if state == ParserState::InStanza && depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((
                        RawFrame::Stanza(bytes_to_string(&buffer[stanza_start..end])),
                        end,
                    )));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            // A construct cut off at the end of the buffer; wait for the next read.
            Err(quick_xml::Error::Syntax(
                e @ (SyntaxError::UnclosedTag
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedPIOrXmlDecl
                | SyntaxError::UnclosedDoctype),
            )) => {
                tracing::trace!(error = %e, "incomplete XML construct, waiting for more input");
                return Ok(None);
            }
            // `<!` split from what follows it.
            Err(quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup)) if buffer.ends_with(b"<!") => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn collect_attrs(e: &BytesStart<'_>) -> Result<Vec<(String, String)>, S2sError> {
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr?;
        let key = bytes_to_string(attr.key.as_ref());
        let value = attr.unescape_value()?.into_owned();
        attrs.push((key, value));
    }
    Ok(attrs)
}

struct Level {
    element: Element,
    default_ns: String,
    prefixes: Vec<(String, String)>,
}

fn resolve_ns(
    name: &str,
    default_ns: &str,
    scopes: &[&[(String, String)]],
) -> Option<String> {
    let Some((prefix, _)) = name.split_once(':') else {
        return Some(default_ns.to_string());
    };
    scopes
        .iter()
        .flat_map(|scope| scope.iter())
        .find(|(p, _)| p == prefix)
        .map(|(_, uri)| uri.clone())
}

fn open_element(
    e: &BytesStart<'_>,
    stack: &[Level],
    stream_ns: &str,
    stream_prefixes: &[(String, String)],
) -> Result<Level, S2sError> {
    let name = bytes_to_string(e.name().as_ref());
    let attrs = collect_attrs(e)?;
    let parent_default = stack.last().map(|l| l.default_ns.as_str()).unwrap_or(stream_ns);
    let default_ns = attrs
        .iter()
        .find(|(k, _)| k == "xmlns")
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| parent_default.to_string());
    let prefixes: Vec<(String, String)> = attrs
        .iter()
        .filter_map(|(k, v)| k.strip_prefix("xmlns:").map(|p| (p.to_string(), v.clone())))
        .collect();

    let mut scopes: Vec<&[(String, String)]> = vec![prefixes.as_slice()];
    scopes.extend(stack.iter().rev().map(|l| l.prefixes.as_slice()));
    scopes.push(stream_prefixes);
    let resolved = resolve_ns(&name, &default_ns, &scopes);

    let mut element = Element::new(name);
    for (k, v) in attrs {
        element.set_attr(k, v);
    }
    element.set_ns(resolved);
    Ok(Level {
        element,
        default_ns,
        prefixes,
    })
}

/// Parse one complete stanza in the context of the stream's default
/// namespace and prefix declarations.
pub fn parse_element(
    raw: &str,
    stream_ns: &str,
    stream_prefixes: &[(String, String)],
) -> Result<Element, S2sError> {
    let mut reader = Reader::from_str(raw);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut stack: Vec<Level> = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let level = open_element(&e, &stack, stream_ns, stream_prefixes)?;
                stack.push(level);
            }
            Event::Empty(e) => {
                let level = open_element(&e, &stack, stream_ns, stream_prefixes)?;
                match stack.last_mut() {
                    Some(parent) => parent.element.push_child(level.element),
                    None => return Ok(level.element),
                }
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.element.push_text(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.element.push_text(&bytes_to_string(&c.into_inner()));
                }
            }
            Event::End(_) => {
                let Some(level) = stack.pop() else {
                    return Err(S2sError::Xml("unbalanced end tag".into()));
                };
                match stack.last_mut() {
                    Some(parent) => parent.element.push_child(level.element),
                    None => return Ok(level.element),
                }
            }
            Event::Eof => return Err(S2sError::Xml("truncated stanza".into())),
            _ => {}
        }
    }
}
