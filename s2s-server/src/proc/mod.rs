//! The S2S processor pipeline.
//!
//! # Design
//!
//! - **Fixed order**: stages are registered once, in [`StageOrder`] order,
//!   and [`Pipeline::stage_names`] exposes that order for inspection.
//! - **First handler wins**: for each inbound stanza the stages run in
//!   order and the first one returning `Ok(true)` ends dispatch.
//! - **Lifecycle fan-out**: `service_started`, `stream_opened`,
//!   `stream_features`, `packet_sent` and `service_stopped` reach every
//!   stage regardless of dispatch.
//! - **Filters**: stanzas no stage consumed go through the
//!   [`PacketFilter`]s (the [`packet_checker::PacketChecker`]) before they
//!   are handed to the router.
//! - **Containment**: a stage error is logged and consumes only the stanza
//!   that caused it. Nothing is authenticated on an error path.

pub mod dialback;
pub mod packet_checker;
pub mod sasl_external;
pub mod selector;
pub mod start_tls;
pub mod start_zlib;
pub mod stream_error;
pub mod stream_features;
pub mod stream_open;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use crate::config::S2sConfig;
use crate::connection::{CertCheckResult, Connection};
use crate::dns::IpLookup;
use crate::error::{S2sError, StreamErrorCondition};
use crate::handler::S2sHandler;
use crate::packet::Packet;
use crate::xml::framing::stream_open_xml;
use crate::xml::{ns, Element, StreamHeader};

pub use selector::{AuthenticationProcessor, AuthenticatorSelectorManager};

/// Authentication mechanisms, in ascending priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AuthMethod {
    Dialback,
    SaslExternal,
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dialback => "dialback",
            Self::SaslExternal => "sasl-external",
        }
    }
}

/// Position of a stage in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StageOrder {
    StreamOpen,
    StreamError,
    StreamFeatures,
    StartTls,
    StartZlib,
    Dialback,
    SaslExternal,
}

/// One protocol stage.
pub trait S2sProcessor: Send + Sync {
    fn order(&self) -> StageOrder;

    fn name(&self) -> &'static str;

    /// Handle an inbound stanza. `Ok(true)` stops dispatch. Packets pushed
    /// to `results` are written back on `conn`.
    fn process(
        &self,
        _packet: &Packet,
        _conn: &Arc<Connection>,
        _results: &mut Vec<Packet>,
    ) -> Result<bool, S2sError> {
        Ok(false)
    }

    fn service_started(&self, _conn: &Arc<Connection>) {}

    fn service_stopped(&self, _conn: &Arc<Connection>) {}

    /// Peer opened (or reopened) its stream. A returned string is written
    /// back before the features element.
    fn stream_opened(&self, _conn: &Arc<Connection>, _header: &StreamHeader) -> Option<String> {
        None
    }

    /// Append this stage's feature advertisements.
    fn stream_features(&self, _conn: &Arc<Connection>, _features: &mut Vec<Element>) {}

    /// A packet produced by the pipeline is about to be written on `conn`.
    fn packet_sent(&self, _packet: &Packet, _conn: &Arc<Connection>) {}
}

/// Outcome of a [`PacketFilter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    Pass,
    Drop,
    /// Addresses of this domain must be resolved before deciding.
    Lookup(String),
}

/// Check applied to stanzas no stage consumed.
pub trait PacketFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn filter(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        results: &mut Vec<Packet>,
    ) -> FilterVerdict;
}

/// What the transport must do after one stanza went through the pipeline.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Packets to write back on the connection, in order.
    pub results: Vec<Packet>,
    /// Authorized stanza for the router.
    pub route: Option<Packet>,
    /// Stanza held until the named domain has been resolved.
    pub deferred: Option<(String, Packet)>,
}

/// Fresh random stream id.
pub fn new_stream_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Send a stream error and close the stream.
///
/// With `open_stream` a stream header is written first, for errors raised
/// before our own header went out.
pub fn generate_stream_error(conn: &Connection, condition: StreamErrorCondition, open_stream: bool) {
    let mut xml = String::new();
    if open_stream {
        let (from, to) = {
            let ctx = conn.context();
            (
                ctx.hostname.clone(),
                ctx.cid.as_ref().map(|c| c.remote_host().to_string()),
            )
        };
        xml.push_str(&stream_open_xml(
            from.as_deref(),
            to.as_deref(),
            Some(&new_stream_id()),
            Some("1.0"),
        ));
    }
    xml.push_str(&format!(
        "<stream:error><{condition} xmlns='{}'/></stream:error>",
        ns::STREAM_ERRORS
    ));
    tracing::warn!(
        session_id = ?conn.session_id(),
        cid = ?conn.cid(),
        %condition,
        "Sending stream error"
    );
    conn.write_raw(xml);
    conn.stop();
}

/// The ordered stage list plus filters.
pub struct Pipeline {
    stages: Vec<Arc<dyn S2sProcessor>>,
    filters: Vec<Arc<dyn PacketFilter>>,
    selector: Arc<AuthenticatorSelectorManager>,
    start_tls: Arc<start_tls::StartTls>,
    dialback: Arc<dialback::Dialback>,
}

impl Pipeline {
    pub fn new(handler: Arc<dyn S2sHandler>, config: &S2sConfig, ips: Arc<dyn IpLookup>) -> Self {
        let selector = Arc::new(AuthenticatorSelectorManager::new(handler.clone()));
        let start_tls = Arc::new(start_tls::StartTls::new(handler.clone()));
        let dialback = Arc::new(dialback::Dialback::new(
            handler.clone(),
            selector.clone(),
            config.dialback_workaround,
        ));
        let sasl = Arc::new(sasl_external::SaslExternal::new(
            handler.clone(),
            selector.clone(),
            config,
        ));

        let dialback_auth: Arc<dyn AuthenticationProcessor> = dialback.clone();
        let sasl_auth: Arc<dyn AuthenticationProcessor> = sasl.clone();
        selector.register(&dialback_auth);
        selector.register(&sasl_auth);

        let stages: Vec<Arc<dyn S2sProcessor>> = vec![
            Arc::new(stream_open::StreamOpen::new(handler.clone())),
            Arc::new(stream_error::StreamError),
            Arc::new(stream_features::StreamFeatures::new(handler.clone())),
            start_tls.clone(),
            Arc::new(start_zlib::StartZlib),
            dialback.clone(),
            sasl,
        ];
        debug_assert!(stages.windows(2).all(|w| w[0].order() < w[1].order()));

        let filters: Vec<Arc<dyn PacketFilter>> = vec![Arc::new(
            packet_checker::PacketChecker::new(config, ips),
        )];

        Self {
            stages,
            filters,
            selector,
            start_tls,
            dialback,
        }
    }

    /// Stage names in dispatch order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn selector(&self) -> &Arc<AuthenticatorSelectorManager> {
        &self.selector
    }

    pub fn dialback(&self) -> &Arc<dialback::Dialback> {
        &self.dialback
    }

    pub fn service_started(&self, conn: &Arc<Connection>) {
        for stage in &self.stages {
            stage.service_started(conn);
        }
    }

    pub fn service_stopped(&self, conn: &Arc<Connection>) {
        for stage in &self.stages {
            stage.service_stopped(conn);
        }
    }

    /// Run the stream-open hooks and build the reply: our header (accept
    /// side) followed by `<stream:features>` when the peer asked for a
    /// versioned stream.
    pub fn stream_opened(&self, conn: &Arc<Connection>, header: &StreamHeader) -> String {
        let mut out = String::new();
        for stage in &self.stages {
            if let Some(reply) = stage.stream_opened(conn, header) {
                out.push_str(&reply);
            }
        }
        if conn.is_accept() && header.version().is_some() && !conn.is_stopped() {
            let features = Packet::new(self.stream_features(conn));
            out.push_str(&features.to_xml());
            self.notify_sent(&features, conn);
        }
        out
    }

    pub fn stream_features(&self, conn: &Arc<Connection>) -> Element {
        let mut children = Vec::new();
        for stage in &self.stages {
            stage.stream_features(conn, &mut children);
        }
        children
            .into_iter()
            .fold(Element::prefixed("stream:features", ns::STREAMS), |f, c| f.with_child(c))
    }

    /// TLS handshake finished on `conn`.
    pub fn tls_completed(&self, conn: &Arc<Connection>, cert_check: CertCheckResult, peer_cert: Option<Vec<u8>>) {
        self.start_tls.tls_established(conn, cert_check, peer_cert);
    }

    pub fn process_packet(&self, packet: Packet, conn: &Arc<Connection>) -> Dispatch {
        let mut dispatch = Dispatch::default();
        let mut handled = false;
        for stage in &self.stages {
            match stage.process(&packet, conn, &mut dispatch.results) {
                Ok(true) => {
                    tracing::trace!(stage = stage.name(), element = packet.name(), "Handled");
                    handled = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        stage = stage.name(),
                        session_id = ?conn.session_id(),
                        error = %e,
                        "Stage failed, dropping stanza"
                    );
                    handled = true;
                    break;
                }
            }
        }
        if !handled && !conn.is_stopped() {
            self.apply_filters(packet, conn, &mut dispatch);
        }
        for p in &dispatch.results {
            self.notify_sent(p, conn);
        }
        dispatch
    }

    /// Re-run the filters for a stanza that waited on a DNS lookup.
    pub fn recheck(&self, packet: Packet, conn: &Arc<Connection>) -> Dispatch {
        let mut dispatch = Dispatch::default();
        if !conn.is_stopped() {
            self.apply_filters(packet, conn, &mut dispatch);
        }
        dispatch
    }

    fn apply_filters(&self, packet: Packet, conn: &Arc<Connection>, dispatch: &mut Dispatch) {
        for filter in &self.filters {
            match filter.filter(&packet, conn, &mut dispatch.results) {
                FilterVerdict::Pass => {}
                FilterVerdict::Drop => {
                    tracing::debug!(filter = filter.name(), element = packet.name(), "Stanza rejected");
                    return;
                }
                FilterVerdict::Lookup(domain) => {
                    dispatch.deferred = Some((domain, packet));
                    return;
                }
            }
        }
        dispatch.route = Some(packet);
    }

    fn notify_sent(&self, packet: &Packet, conn: &Arc<Connection>) {
        for stage in &self.stages {
            stage.packet_sent(packet, conn);
        }
    }
}
