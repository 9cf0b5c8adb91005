//! SASL EXTERNAL over the TLS peer certificate (XEP-0178).

use std::collections::HashSet;
use std::sync::Arc;

use base64::Engine;

use super::selector::{AuthenticationProcessor, AuthenticatorSelectorManager};
use super::stream_open::StreamOpen;
use super::{AuthMethod, S2sProcessor, StageOrder};
use crate::config::S2sConfig;
use crate::connection::{CertCheckResult, Connection};
use crate::error::S2sError;
use crate::handler::S2sHandler;
use crate::packet::Packet;
use crate::tls::certificate_matches_domain;
use crate::xml::{ns, Element};

pub struct SaslExternal {
    handler: Arc<dyn S2sHandler>,
    selector: Arc<AuthenticatorSelectorManager>,
    /// Send the base64 local domain as authzid instead of `=`.
    legacy_compat: bool,
    skip_domains: HashSet<String>,
}

fn failure(condition: &str, text: &str) -> Packet {
    Packet::new(
        Element::with_ns("failure", ns::SASL)
            .with_child(Element::new(condition))
            .with_child(Element::new("text").with_text(text)),
    )
}

/// A non-empty mechanism list that includes EXTERNAL.
fn offers_external(features: &Element) -> bool {
    features
        .child("mechanisms", ns::SASL)
        .is_some_and(|m| {
            m.children()
                .iter()
                .any(|c| c.local_name() == "mechanism" && c.text().trim() == "EXTERNAL")
        })
}

impl SaslExternal {
    pub fn new(
        handler: Arc<dyn S2sHandler>,
        selector: Arc<AuthenticatorSelectorManager>,
        config: &S2sConfig,
    ) -> Self {
        Self {
            handler,
            selector,
            legacy_compat: config.sasl_legacy_compat,
            skip_domains: config
                .sasl_skip_domains
                .iter()
                .map(|d| d.to_lowercase())
                .collect(),
        }
    }

    fn skipped(&self, conn: &Connection) -> bool {
        conn.cid().is_some_and(|cid| {
            self.skip_domains.contains(cid.local_host()) || self.skip_domains.contains(cid.remote_host())
        })
    }

    fn send_auth_request(&self, conn: &Connection, results: &mut Vec<Packet>) -> Result<(), S2sError> {
        let cid = conn.cid().ok_or(S2sError::MissingCid)?;
        let authzid = if self.legacy_compat {
            base64::engine::general_purpose::STANDARD.encode(cid.local_host())
        } else {
            "=".to_string()
        };
        results.push(Packet::new(
            Element::with_ns("auth", ns::SASL)
                .with_attr("mechanism", "EXTERNAL")
                .with_text(authzid),
        ));
        tracing::debug!(cid = %cid, "SASL EXTERNAL requested");
        Ok(())
    }

    fn reject(&self, packet: &Packet, conn: &Arc<Connection>, condition: &str, reason: &str, results: &mut Vec<Packet>) {
        tracing::info!(
            session_id = ?conn.session_id(),
            cid = ?conn.cid(),
            reason,
            "SASL EXTERNAL rejected"
        );
        results.push(failure(condition, reason));
        self.selector
            .authentication_failed(packet, conn, AuthMethod::SaslExternal, results);
    }

    /// Responder side: authenticate the peer by its certificate.
    fn process_auth(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        results: &mut Vec<Packet>,
    ) -> Result<(), S2sError> {
        if packet.attr("mechanism") != Some("EXTERNAL") {
            self.reject(packet, conn, "invalid-mechanism", "Only EXTERNAL is supported", results);
            return Ok(());
        }
        let Some(cert) = conn.peer_certificate() else {
            self.reject(packet, conn, "invalid-authzid", "No peer certificate", results);
            return Ok(());
        };
        let cert_check = conn.context().cert_check;
        if !matches!(cert_check, Some(CertCheckResult::Trusted | CertCheckResult::SelfSigned)) {
            self.reject(packet, conn, "invalid-authzid", "Certificate is not trusted", results);
            return Ok(());
        }
        let Some(cid) = conn.cid() else {
            self.reject(packet, conn, "invalid-authzid", "Unknown origin hostname", results);
            return Ok(());
        };
        if !certificate_matches_domain(&cert, cid.remote_host()).unwrap_or(false) {
            self.reject(
                packet,
                conn,
                "invalid-authzid",
                "Certificate name doesn't match to domain name",
                results,
            );
            return Ok(());
        }
        let authzid = packet.element().text().trim();
        if !authzid.is_empty() && authzid != "=" {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(authzid)
                .ok()
                .and_then(|b| String::from_utf8(b).ok());
            if !decoded.is_some_and(|d| d.eq_ignore_ascii_case(cid.remote_host())) {
                self.reject(
                    packet,
                    conn,
                    "invalid-authzid",
                    "Authorization identity doesn't match to domain name",
                    results,
                );
                return Ok(());
            }
        }

        let cc = self
            .handler
            .get_cid_connections(&cid, true)?
            .ok_or(S2sError::MissingCid)?;
        self.selector.authenticate_connection(conn, &cc, &cid);
        tracing::info!(cid = %cid, session_id = ?conn.session_id(), "SASL EXTERNAL succeeded");
        results.push(Packet::new(Element::with_ns("success", ns::SASL)));
        Ok(())
    }

    /// Initiator side: restart the stream, then count the CID as authenticated.
    fn process_success(&self, conn: &Arc<Connection>) -> Result<(), S2sError> {
        let cid = conn.cid().ok_or(S2sError::MissingCid)?;
        conn.xmpp_stream_open(StreamOpen::initial_header(&cid));
        self.selector.authenticate_cid(conn, &cid)?;
        tracing::info!(cid = %cid, session_id = ?conn.session_id(), "Authenticated with SASL EXTERNAL");
        Ok(())
    }
}

impl S2sProcessor for SaslExternal {
    fn order(&self) -> StageOrder {
        StageOrder::SaslExternal
    }

    fn name(&self) -> &'static str {
        "sasl-external"
    }

    fn process(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        results: &mut Vec<Packet>,
    ) -> Result<bool, S2sError> {
        // Last stage: features on outgoing streams end here either way.
        if packet.is_features() && conn.is_connect() {
            if self.selector.is_allowed(packet, conn, self) {
                self.send_auth_request(conn, results)?;
            }
            return Ok(true);
        }
        if packet.xmlns() != Some(ns::SASL) {
            return Ok(false);
        }
        match packet.name() {
            "auth" if conn.is_accept() => self.process_auth(packet, conn, results)?,
            "success" if conn.is_connect() => self.process_success(conn)?,
            "failure" if conn.is_connect() => {
                tracing::info!(cid = ?conn.cid(), "Peer refused SASL EXTERNAL");
                self.selector
                    .authentication_failed(packet, conn, AuthMethod::SaslExternal, results);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn stream_features(&self, conn: &Arc<Connection>, features: &mut Vec<Element>) {
        if !conn.is_accept() || conn.is_authenticated() || self.skipped(conn) {
            return;
        }
        {
            let ctx = conn.context();
            if ctx.handshaking_only || !ctx.cert_check.is_some_and(|c| c.is_presented()) {
                return;
            }
        }
        features.push(
            Element::with_ns("mechanisms", ns::SASL)
                .with_child(Element::new("mechanism").with_text("EXTERNAL")),
        );
        conn.context().methods_available.insert(AuthMethod::SaslExternal);
    }
}

impl AuthenticationProcessor for SaslExternal {
    fn method(&self) -> AuthMethod {
        AuthMethod::SaslExternal
    }

    fn can_handle(&self, packet: &Packet, conn: &Arc<Connection>) -> bool {
        if !packet.is_features() || !conn.is_connect() || self.skipped(conn) {
            return false;
        }
        if !offers_external(packet.element()) {
            return false;
        }
        let ctx = conn.context();
        ctx.tls && !ctx.handshaking_only && ctx.cert_check != Some(CertCheckResult::Invalid)
    }

    fn restart_auth(
        &self,
        _packet: &Packet,
        conn: &Arc<Connection>,
        results: &mut Vec<Packet>,
    ) -> Result<(), S2sError> {
        self.send_auth_request(conn, results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnCommand;
    use crate::proc::test_support::{cid, drain, features, fixture, Fixture, REMOTE};

    fn mechanisms() -> Element {
        Element::with_ns("mechanisms", ns::SASL)
            .with_child(Element::new("mechanism").with_text("EXTERNAL"))
    }

    fn cert_for(domain: &str) -> Vec<u8> {
        rcgen::generate_simple_self_signed(vec![domain.to_string()])
            .unwrap()
            .cert
            .der()
            .to_vec()
    }

    fn secured_accept(f: &Fixture, cert: Option<Vec<u8>>, check: CertCheckResult) -> (Arc<Connection>, tokio::sync::mpsc::UnboundedReceiver<ConnCommand>) {
        let (conn, rx) = f.accept();
        f.pipeline.tls_completed(&conn, check, cert);
        conn.context().cid = Some(cid());
        {
            let mut ctx = conn.context();
            ctx.methods_available.insert(AuthMethod::Dialback);
            ctx.methods_available.insert(AuthMethod::SaslExternal);
        }
        (conn, rx)
    }

    fn auth(authzid: &str) -> Packet {
        Packet::new(
            Element::with_ns("auth", ns::SASL)
                .with_attr("mechanism", "EXTERNAL")
                .with_text(authzid),
        )
    }

    #[test]
    fn initiator_requests_external_after_tls() {
        let f = fixture();
        let (conn, _rx) = f.connect(cid());
        conn.context().tls = true;
        conn.context().cert_check = Some(CertCheckResult::Trusted);
        let dispatch = f.pipeline.process_packet(features(vec![mechanisms()]), &conn);
        assert_eq!(
            dispatch.results[0].to_xml(),
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='EXTERNAL'>bG9jYWwudGVzdA==</auth>"
        );
        assert_eq!(conn.context().method_used, Some(AuthMethod::SaslExternal));
    }

    #[test]
    fn non_legacy_authzid_is_equals_sign() {
        let config = S2sConfig {
            sasl_legacy_compat: false,
            ..S2sConfig::default()
        };
        let f = Fixture::with_config(config);
        let (conn, _rx) = f.connect(cid());
        conn.context().tls = true;
        conn.context().cert_check = Some(CertCheckResult::Trusted);
        let dispatch = f.pipeline.process_packet(features(vec![mechanisms()]), &conn);
        assert!(dispatch.results[0].to_xml().ends_with(">=</auth>"));
    }

    #[test]
    fn empty_mechanism_list_is_ignored() {
        let f = fixture();
        let (conn, _rx) = f.connect(cid());
        conn.context().tls = true;
        conn.context().cert_check = Some(CertCheckResult::SelfSigned);
        let empty = features(vec![Element::with_ns("mechanisms", ns::SASL)]);
        let dispatch = f.pipeline.process_packet(empty, &conn);
        assert!(dispatch.results.iter().all(|p| p.name() != "auth"));
    }

    #[test]
    fn skipped_domain_never_uses_external() {
        let config = S2sConfig {
            sasl_skip_domains: [REMOTE.to_string()].into_iter().collect(),
            ..S2sConfig::default()
        };
        let f = Fixture::with_config(config);
        let (conn, _rx) = f.connect(cid());
        conn.context().tls = true;
        conn.context().cert_check = Some(CertCheckResult::SelfSigned);
        let dispatch = f.pipeline.process_packet(features(vec![mechanisms()]), &conn);
        assert!(dispatch.results.iter().all(|p| p.name() != "auth"));
    }

    #[test]
    fn responder_accepts_matching_certificate() {
        let f = fixture();
        let (conn, _rx) = secured_accept(&f, Some(cert_for(REMOTE)), CertCheckResult::SelfSigned);
        let dispatch = f.pipeline.process_packet(auth("cmVtb3RlLnRlc3Q="), &conn);
        assert_eq!(
            dispatch.results[0].to_xml(),
            "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>"
        );
        assert!(conn.is_authenticated_cid(&cid()));
    }

    #[test]
    fn responder_rejects_wrong_name_and_waits() {
        let f = fixture();
        let (conn, mut rx) = secured_accept(&f, Some(cert_for("other.test")), CertCheckResult::SelfSigned);
        let dispatch = f.pipeline.process_packet(auth("="), &conn);
        assert_eq!(
            dispatch.results[0].to_xml(),
            "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><invalid-authzid/>\
             <text>Certificate name doesn&apos;t match to domain name</text></failure>"
        );
        assert!(!conn.is_authenticated());
        // Dialback is still available to the peer.
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn responder_rejects_mismatched_authzid() {
        let f = fixture();
        let (conn, _rx) = secured_accept(&f, Some(cert_for(REMOTE)), CertCheckResult::Trusted);
        let dispatch = f.pipeline.process_packet(auth("bG9jYWwudGVzdA=="), &conn);
        assert!(dispatch.results[0].to_xml().starts_with("<failure"));
        assert!(!conn.is_authenticated());
    }

    #[test]
    fn untrusted_certificate_is_rejected_and_last_method_stops() {
        let f = fixture();
        let (conn, mut rx) = secured_accept(&f, Some(cert_for(REMOTE)), CertCheckResult::Untrusted);
        conn.context().methods_available.remove(&AuthMethod::Dialback);
        let dispatch = f.pipeline.process_packet(auth("="), &conn);
        assert!(dispatch.results.is_empty());
        let cmds = drain(&mut rx);
        assert!(matches!(&cmds[0], ConnCommand::Write(x) if x.contains("Certificate is not trusted")));
        assert_eq!(cmds.last(), Some(&ConnCommand::ForceStop));
    }

    #[test]
    fn success_restarts_stream_then_authenticates() {
        let f = fixture();
        let (conn, mut rx) = f.connect(cid());
        f.pipeline
            .process_packet(Packet::new(Element::with_ns("success", ns::SASL)), &conn);
        assert!(conn.is_authenticated_cid(&cid()));
        assert!(matches!(&drain(&mut rx)[0], ConnCommand::StreamOpen(h) if h.contains("version='1.0'")));
    }

    #[test]
    fn advertised_only_with_presented_certificate() {
        let f = fixture();
        let (conn, _rx) = f.accept();
        conn.context().cid = Some(cid());
        assert!(f.pipeline.stream_features(&conn).child("mechanisms", ns::SASL).is_none());

        f.pipeline
            .tls_completed(&conn, CertCheckResult::Untrusted, Some(cert_for(REMOTE)));
        assert!(f.pipeline.stream_features(&conn).child("mechanisms", ns::SASL).is_some());
        assert!(conn.context().methods_available.contains(&AuthMethod::SaslExternal));
    }
}
