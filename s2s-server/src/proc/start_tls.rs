//! STARTTLS negotiation in both directions.

use std::sync::Arc;

use super::stream_open::StreamOpen;
use super::{generate_stream_error, S2sProcessor, StageOrder};
use crate::connection::{CertCheckResult, Connection};
use crate::error::{S2sError, StreamErrorCondition};
use crate::handler::S2sHandler;
use crate::packet::Packet;
use crate::xml::{ns, Element};

pub struct StartTls {
    handler: Arc<dyn S2sHandler>,
}

impl StartTls {
    pub fn new(handler: Arc<dyn S2sHandler>) -> Self {
        Self { handler }
    }

    /// Local and remote domain of `conn`, as far as they are known.
    fn domains(conn: &Connection) -> (Option<String>, Option<String>) {
        let ctx = conn.context();
        let local = ctx
            .cid
            .as_ref()
            .map(|c| c.local_host().to_string())
            .or_else(|| ctx.hostname.clone());
        let remote = ctx.cid.as_ref().map(|c| c.remote_host().to_string());
        (local, remote)
    }

    fn skipped(&self, remote: Option<&str>) -> bool {
        remote.is_some_and(|r| self.handler.skip_tls_for_host(r))
    }

    fn tls_required(&self, conn: &Connection) -> bool {
        let (local, remote) = Self::domains(conn);
        local.is_some_and(|l| self.handler.is_tls_required(&l)) && !self.skipped(remote.as_deref())
    }

    /// Record the outcome of a finished handshake. Outgoing connections
    /// reopen their stream over the secured channel.
    pub fn tls_established(
        &self,
        conn: &Arc<Connection>,
        cert_check: CertCheckResult,
        peer_cert: Option<Vec<u8>>,
    ) {
        {
            let mut ctx = conn.context();
            ctx.tls = true;
            ctx.cert_check = Some(cert_check);
        }
        conn.set_peer_certificate(peer_cert);
        tracing::info!(
            session_id = ?conn.session_id(),
            cid = ?conn.cid(),
            cert = ?cert_check,
            direction = ?conn.connection_type(),
            "TLS established"
        );
        if conn.is_connect() {
            if let Some(cid) = conn.cid() {
                conn.xmpp_stream_open(StreamOpen::initial_header(&cid));
            }
        }
    }

    fn on_outgoing_features(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        results: &mut Vec<Packet>,
    ) -> bool {
        if conn.context().tls {
            return false;
        }
        let (_, remote) = Self::domains(conn);
        let skip = self.skipped(remote.as_deref());
        match packet.element().child("starttls", ns::TLS) {
            Some(offer) => {
                let required = offer.child_named("required").is_some();
                if !self.handler.tls_available() {
                    if required {
                        tracing::warn!(remote = ?remote, "Peer requires TLS but no certificate is configured");
                        generate_stream_error(conn, StreamErrorCondition::PolicyViolation, false);
                        return true;
                    }
                    tracing::debug!(remote = ?remote, "TLS unavailable, ignoring offer");
                    return false;
                }
                if skip && !required {
                    tracing::debug!(remote = ?remote, "Skipping offered TLS");
                    return false;
                }
                results.push(Packet::new(Element::with_ns("starttls", ns::TLS)));
                true
            }
            None if self.tls_required(conn) => {
                tracing::warn!(remote = ?remote, "Peer does not offer required TLS");
                generate_stream_error(conn, StreamErrorCondition::PolicyViolation, false);
                true
            }
            None => false,
        }
    }
}

impl S2sProcessor for StartTls {
    fn order(&self) -> StageOrder {
        StageOrder::StartTls
    }

    fn name(&self) -> &'static str {
        "starttls"
    }

    fn process(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        results: &mut Vec<Packet>,
    ) -> Result<bool, S2sError> {
        if packet.is_features() && conn.is_connect() {
            return Ok(self.on_outgoing_features(packet, conn, results));
        }
        if packet.xmlns() != Some(ns::TLS) {
            return Ok(false);
        }
        match packet.name() {
            "starttls" if conn.is_accept() => {
                if !self.handler.tls_available() || conn.context().tls {
                    conn.write_raw(Element::with_ns("failure", ns::TLS).to_xml());
                    conn.stop();
                    return Ok(true);
                }
                // Proceed must hit the wire before the handshake starts.
                conn.write_raw(Element::with_ns("proceed", ns::TLS).to_xml());
                conn.start_tls(false, true, false);
                Ok(true)
            }
            "proceed" if conn.is_connect() => {
                conn.start_tls(true, false, false);
                Ok(true)
            }
            "failure" => {
                tracing::warn!(session_id = ?conn.session_id(), cid = ?conn.cid(), "Peer refused TLS");
                conn.stop();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn stream_features(&self, conn: &Arc<Connection>, features: &mut Vec<Element>) {
        if !conn.is_accept() || !self.handler.tls_available() || conn.context().tls {
            return;
        }
        let mut starttls = Element::with_ns("starttls", ns::TLS);
        if self.tls_required(conn) {
            starttls.push_child(Element::new("required"));
        }
        features.push(starttls);
    }
}
