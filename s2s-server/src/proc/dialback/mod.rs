//! Server dialback (XEP-0220).
//!
//! Roles, by the element and direction a connection sees:
//!
//! | element               | connection | role                                   |
//! |-----------------------|------------|----------------------------------------|
//! | untyped `db:result`   | accept     | receiving server, relays to a verifier |
//! | typed `db:result`     | connect    | originating server, gets the verdict   |
//! | untyped `db:verify`   | accept     | authoritative server, checks the key   |
//! | typed `db:verify`     | connect    | receiving server, side connection      |
//!
//! Verify requests travel on handshaking-only side connections opened by
//! the handler. Their answers are matched against [`PendingVerifications`]
//! and the domains recorded on the side connection, never by arrival order.

pub mod key;
pub mod pending;

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::selector::{AuthenticationProcessor, AuthenticatorSelectorManager};
use super::{generate_stream_error, AuthMethod, S2sProcessor, StageOrder};
use crate::cid::Cid;
use crate::cid_connections::CidConnections;
use crate::connection::{CertCheckResult, Connection};
use crate::error::{S2sError, StreamErrorCondition};
use crate::handler::{DialbackElement, S2sHandler, VerifyResult};
use crate::packet::Packet;
use crate::xml::{ns, Element, StreamHeader};

pub use key::{dialback_key, verify_key};
pub use pending::{PendingVerifications, PendingVerify};

pub struct Dialback {
    handler: Arc<dyn S2sHandler>,
    selector: Arc<AuthenticatorSelectorManager>,
    /// Run dialback with trusted peers that do not advertise it.
    workaround: bool,
    pending: PendingVerifications,
}

fn offers_external(features: &Element) -> bool {
    features
        .child("mechanisms", ns::SASL)
        .is_some_and(|m| m.children().iter().any(|c| c.text().trim() == "EXTERNAL"))
}

fn stanza_error(condition: &str) -> Element {
    Element::new("error")
        .with_attr("type", "cancel")
        .with_child(Element::with_ns(condition, ns::STANZA_ERRORS))
}

impl Dialback {
    pub fn new(
        handler: Arc<dyn S2sHandler>,
        selector: Arc<AuthenticatorSelectorManager>,
        workaround: bool,
    ) -> Self {
        Self {
            handler,
            selector,
            workaround,
            pending: PendingVerifications::new(),
        }
    }

    pub fn pending(&self) -> &PendingVerifications {
        &self.pending
    }

    /// Drop verifications that never got an answer.
    pub fn expire_pending(&self, max_age: Duration) -> usize {
        let expired = self.pending.expire_at(Instant::now(), max_age);
        for (cid, stream_id) in &expired {
            tracing::info!(cid = %cid, stream_id = %stream_id, "Dialback verification expired");
        }
        expired.len()
    }

    fn skip_tls(&self, conn: &Connection) -> bool {
        conn.cid()
            .is_some_and(|c| self.handler.skip_tls_for_host(c.remote_host()))
    }

    /// TLS is offered, usable here and not yet negotiated; dialback has
    /// to wait.
    fn waiting_for_tls(&self, features: &Element, conn: &Connection) -> bool {
        features.has_child("starttls", ns::TLS)
            && self.handler.tls_available()
            && conn.context().cert_check.is_none()
            && !self.skip_tls(conn)
    }

    /// Trusted peer that did not ask for dialback and offers no SASL
    /// EXTERNAL: the certificate alone authenticates it.
    fn trusted_without_dialback(&self, features: &Element, conn: &Connection) -> bool {
        !self.workaround
            && conn.context().cert_check == Some(CertCheckResult::Trusted)
            && !features.has_child("dialback", ns::DIALBACK_FEATURES)
            && !offers_external(features)
    }

    fn cid_connections(&self, cid: &Cid) -> Result<Arc<CidConnections>, S2sError> {
        self.handler
            .get_cid_connections(cid, true)?
            .ok_or(S2sError::MissingCid)
    }

    /// Send `<db:result>KEY</db:result>` for the connection's CID.
    fn init_dialback(&self, conn: &Arc<Connection>, results: &mut Vec<Packet>) -> Result<(), S2sError> {
        let cid = conn.cid().ok_or(S2sError::MissingCid)?;
        if conn.context().handshaking_only {
            return Ok(());
        }
        let stream_id = conn.session_id().ok_or(S2sError::MissingStreamId)?;
        let secret = self.handler.secret_for_domain(cid.local_host())?;
        let key = dialback_key(&secret, cid.remote_host(), cid.local_host(), &stream_id)?;
        results.push(Packet::new(
            Element::prefixed("db:result", ns::DIALBACK)
                .with_attr("from", cid.local_host())
                .with_attr("to", cid.remote_host())
                .with_text(key),
        ));
        conn.context()
            .requested_result_domains
            .insert(cid.remote_host().to_string());
        tracing::debug!(cid = %cid, session_id = %stream_id, "Dialback key sent");
        Ok(())
    }

    /// Write the queued `<db:verify>` requests on a side connection.
    fn send_verify_requests(&self, conn: &Arc<Connection>, out: &mut Vec<Packet>) -> Result<(), S2sError> {
        let cid = conn.cid().ok_or(S2sError::MissingCid)?;
        let requests = self.cid_connections(&cid)?.take_verify_requests();
        if requests.is_empty() && conn.context().handshaking_domains.is_empty() {
            tracing::debug!(cid = %cid, "Side connection has nothing to verify, closing");
            conn.stop();
            return Ok(());
        }
        {
            let mut ctx = conn.context();
            for request in &requests {
                if let Some(to) = request.to_domain() {
                    ctx.handshaking_domains.insert(to.to_string());
                    ctx.verify_ids
                        .insert((to.to_string(), request.id().unwrap_or_default().to_string()));
                }
            }
        }
        tracing::debug!(cid = %cid, count = requests.len(), "Sending dialback verify requests");
        out.extend(requests);
        Ok(())
    }

    fn on_outgoing_features(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        results: &mut Vec<Packet>,
    ) -> Result<bool, S2sError> {
        let features = packet.element();
        if conn.context().handshaking_only {
            if self.waiting_for_tls(features, conn) {
                return Ok(false);
            }
            self.send_verify_requests(conn, results)?;
            return Ok(true);
        }
        if conn.is_authenticated() || self.waiting_for_tls(features, conn) {
            return Ok(false);
        }
        if self.trusted_without_dialback(features, conn) {
            let cid = conn.cid().ok_or(S2sError::MissingCid)?;
            let cc = self.cid_connections(&cid)?;
            tracing::info!(cid = %cid, "Trusted certificate, authenticating without dialback");
            self.selector.authenticate_connection(conn, &cc, &cid);
            cc.stream_negotiation_completed(conn);
            return Ok(true);
        }
        if self.selector.is_allowed(packet, conn, self) {
            self.init_dialback(conn, results)?;
        }
        // Later mechanisms still see the features so they can register
        // as fallbacks.
        Ok(false)
    }

    fn process_dialback(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        results: &mut Vec<Packet>,
    ) -> Result<(), S2sError> {
        let (Some(from), Some(to)) = (packet.from_domain(), packet.to_domain()) else {
            generate_stream_error(conn, StreamErrorCondition::ImproperAddressing, false);
            return Ok(());
        };
        let cid_packet = Cid::new(to, from);

        // Peers that omit from/to on the stream header bind it here.
        if conn.cid().is_none() {
            let mut ctx = conn.context();
            ctx.hostname = Some(cid_packet.local_host().to_string());
            ctx.cid = Some(cid_packet.clone());
        }

        let cc = match self.handler.get_cid_connections(&cid_packet, true) {
            Ok(Some(cc)) => cc,
            Ok(None) => return Err(S2sError::MissingCid),
            Err(e) => {
                tracing::info!(cid = %cid_packet, error = %e, "Dialback for foreign domain pair");
                generate_stream_error(conn, e.stream_condition(), false);
                return Ok(());
            }
        };
        if conn.is_accept() {
            cc.add_incoming(conn);
        }

        let typed = packet.stanza_type().map(str::to_string);
        match (packet.name(), typed.as_deref()) {
            ("result", None) if conn.is_accept() => {
                self.relay_result(packet, conn, &cid_packet, results)
            }
            ("result", Some(kind)) if conn.is_connect() => {
                self.result_verdict(packet, conn, &cc, &cid_packet, kind, results);
                Ok(())
            }
            ("verify", None) => self.answer_verify(packet, &cid_packet, results),
            ("verify", Some(kind)) if conn.is_connect() => {
                self.verify_verdict(packet, conn, &cid_packet, kind)
            }
            (name, kind) => {
                tracing::debug!(
                    session_id = ?conn.session_id(),
                    element = name,
                    kind = ?kind,
                    direction = ?conn.connection_type(),
                    "Ignoring dialback element"
                );
                Ok(())
            }
        }
    }

    /// Receiving server: relay the peer's key to its authoritative server.
    fn relay_result(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        cid_packet: &Cid,
        results: &mut Vec<Packet>,
    ) -> Result<(), S2sError> {
        let reply = |valid: Option<bool>, error: Option<Element>| VerifyResult {
            element: DialbackElement::Result,
            cid_main: conn.cid().unwrap_or_else(|| cid_packet.clone()),
            cid_packet: cid_packet.clone(),
            valid,
            id: None,
            session_id: conn.session_id(),
            key: None,
            side_connection: false,
            error,
        };

        let tls = conn.context().tls;
        if !tls
            && self.handler.is_tls_required(cid_packet.local_host())
            && !self.handler.skip_tls_for_host(cid_packet.remote_host())
        {
            tracing::info!(cid = %cid_packet, "Dialback without required TLS");
            results.push(Packet::new(
                reply(None, Some(stanza_error("policy-violation"))).to_element(),
            ));
            return Ok(());
        }
        if conn.is_authenticated_cid(cid_packet) {
            tracing::debug!(cid = %cid_packet, "Domain pair already authenticated");
            results.push(Packet::new(reply(Some(true), None).to_element()));
            return Ok(());
        }

        let stream_id = conn.session_id().ok_or(S2sError::MissingStreamId)?;
        let key = packet.element().text().trim().to_string();
        if key.is_empty() {
            results.push(Packet::new(reply(Some(false), None).to_element()));
            return Ok(());
        }

        self.pending
            .record(cid_packet.clone(), stream_id.clone(), stream_id.clone());
        let request = VerifyResult {
            element: DialbackElement::Verify,
            cid_main: conn.cid().unwrap_or_else(|| cid_packet.clone()),
            cid_packet: cid_packet.clone(),
            valid: None,
            id: Some(stream_id.clone()),
            session_id: Some(stream_id.clone()),
            key: Some(key),
            side_connection: true,
            error: None,
        };
        if !self.handler.send_verify_result(request) {
            self.pending.take(cid_packet, &stream_id);
            tracing::warn!(cid = %cid_packet, "No route to verify dialback key");
            results.push(Packet::new(
                reply(None, Some(stanza_error("remote-server-not-found"))).to_element(),
            ));
            return Ok(());
        }
        tracing::debug!(cid = %cid_packet, session_id = %stream_id, "Dialback key relayed for verification");
        Ok(())
    }

    /// Authoritative server: recompute and compare the key.
    fn answer_verify(
        &self,
        packet: &Packet,
        cid_packet: &Cid,
        results: &mut Vec<Packet>,
    ) -> Result<(), S2sError> {
        let stream_id = packet.id().unwrap_or_default();
        let secret = self.handler.secret_for_domain(cid_packet.local_host())?;
        let valid = !stream_id.is_empty()
            && verify_key(
                &secret,
                cid_packet.remote_host(),
                cid_packet.local_host(),
                stream_id,
                packet.element().text(),
            )?;
        tracing::debug!(cid = %cid_packet, stream_id = %stream_id, valid, "Dialback key checked");
        let answer = VerifyResult {
            element: DialbackElement::Verify,
            cid_main: cid_packet.clone(),
            cid_packet: cid_packet.clone(),
            valid: Some(valid),
            id: packet.id().map(str::to_string),
            session_id: None,
            key: None,
            side_connection: false,
            error: None,
        };
        results.push(Packet::new(answer.to_element()));
        Ok(())
    }

    /// Receiving server, side connection: the authoritative verdict.
    fn verify_verdict(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        cid_packet: &Cid,
        kind: &str,
    ) -> Result<(), S2sError> {
        let remote = cid_packet.remote_host();
        let stream_id = packet.id().unwrap_or_default();
        let requested = conn.context().handshaking_domains.contains(remote);
        let Some(pending) = requested
            .then(|| self.pending.take(cid_packet, stream_id))
            .flatten()
        else {
            tracing::warn!(
                cid = %cid_packet,
                stream_id = %stream_id,
                session_id = ?conn.session_id(),
                "Unsolicited dialback verify answer ignored"
            );
            return Ok(());
        };

        let valid = kind == "valid";
        let origin = self.handler.connection_for_session(&pending.origin_session);
        if valid {
            match &origin {
                Some(origin) => {
                    if self.selector.authenticate_cid(origin, cid_packet)? {
                        if let Ok(Some(cc)) = self.handler.get_cid_connections(cid_packet, false) {
                            cc.stream_negotiation_completed(origin);
                        }
                    }
                }
                None => tracing::info!(
                    cid = %cid_packet,
                    session_id = %pending.origin_session,
                    "Requesting stream closed before verification finished"
                ),
            }
        }

        self.handler.send_verify_result(VerifyResult {
            element: DialbackElement::Result,
            cid_main: conn.cid().unwrap_or_else(|| cid_packet.clone()),
            cid_packet: cid_packet.clone(),
            valid: Some(valid),
            id: None,
            session_id: Some(pending.origin_session.clone()),
            key: None,
            side_connection: false,
            error: None,
        });

        if !valid {
            tracing::info!(cid = %cid_packet, "Dialback key rejected by authoritative server");
            if let Some(origin) = &origin {
                self.selector
                    .authentication_failed(packet, origin, AuthMethod::Dialback, &mut Vec::new());
            }
        }

        let done = {
            let mut ctx = conn.context();
            ctx.verify_ids.remove(&(remote.to_string(), stream_id.to_string()));
            // Other connections' requests for this domain do not keep this one open.
            if !ctx.verify_ids.iter().any(|(domain, _)| domain == remote) {
                ctx.handshaking_domains.remove(remote);
            }
            ctx.handshaking_only && ctx.handshaking_domains.is_empty()
        };
        if done {
            tracing::debug!(cid = ?conn.cid(), "Side connection finished verifying");
            conn.stop();
        }
        Ok(())
    }

    /// Originating server: verdict on our own `<db:result>`.
    fn result_verdict(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        cc: &CidConnections,
        cid_packet: &Cid,
        kind: &str,
        results: &mut Vec<Packet>,
    ) {
        let requested = conn
            .context()
            .requested_result_domains
            .remove(cid_packet.remote_host());
        if !requested {
            tracing::warn!(cid = %cid_packet, "Unsolicited dialback result ignored");
            return;
        }
        if kind == "valid" {
            if self.selector.authenticate_connection(conn, cc, cid_packet) {
                cc.stream_negotiation_completed(conn);
            }
            return;
        }
        let condition = packet
            .element()
            .child_named("error")
            .and_then(|e| e.children().first())
            .map(|c| c.local_name().to_string());
        tracing::info!(cid = %cid_packet, kind, condition = ?condition, "Dialback refused");
        self.selector
            .authentication_failed(packet, conn, AuthMethod::Dialback, results);
    }
}

impl S2sProcessor for Dialback {
    fn order(&self) -> StageOrder {
        StageOrder::Dialback
    }

    fn name(&self) -> &'static str {
        "dialback"
    }

    fn process(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        results: &mut Vec<Packet>,
    ) -> Result<bool, S2sError> {
        if packet.xmlns() == Some(ns::DIALBACK) {
            self.process_dialback(packet, conn, results)?;
            return Ok(true);
        }
        if packet.is_features() && conn.is_connect() {
            return self.on_outgoing_features(packet, conn, results);
        }
        Ok(false)
    }

    fn stream_opened(&self, conn: &Arc<Connection>, header: &StreamHeader) -> Option<String> {
        if header.version().is_some() || !conn.is_connect() || conn.is_stopped() {
            return None;
        }
        // Legacy peers send no features; dialback starts right away.
        let mut out = Vec::new();
        let started = if conn.context().handshaking_only {
            self.send_verify_requests(conn, &mut out)
        } else if self.selector.claim(conn, AuthMethod::Dialback) {
            self.init_dialback(conn, &mut out)
        } else {
            Ok(())
        };
        if let Err(e) = started {
            tracing::warn!(session_id = ?conn.session_id(), error = %e, "Legacy dialback failed to start");
        }
        for packet in &out {
            conn.send_packet(packet);
        }
        None
    }

    fn stream_features(&self, conn: &Arc<Connection>, features: &mut Vec<Element>) {
        if !conn.is_accept() {
            return;
        }
        let trusted = conn.context().cert_check == Some(CertCheckResult::Trusted);
        let mut dialback = Element::with_ns("dialback", ns::DIALBACK_FEATURES).with_child(Element::new("errors"));
        if !trusted && !conn.is_authenticated() {
            dialback.push_child(Element::new("required"));
        }
        features.push(dialback);
        conn.context().methods_available.insert(AuthMethod::Dialback);
    }
}

impl AuthenticationProcessor for Dialback {
    fn method(&self) -> AuthMethod {
        AuthMethod::Dialback
    }

    fn can_handle(&self, packet: &Packet, conn: &Arc<Connection>) -> bool {
        if !packet.is_features() || !conn.is_connect() {
            return false;
        }
        let features = packet.element();
        let (handshaking_only, cert) = {
            let ctx = conn.context();
            (ctx.handshaking_only, ctx.cert_check)
        };
        if handshaking_only || cert == Some(CertCheckResult::Invalid) {
            return false;
        }
        if self.waiting_for_tls(features, conn) {
            return false;
        }
        let advertised = features.has_child("dialback", ns::DIALBACK_FEATURES);
        let unneeded = cert == Some(CertCheckResult::Trusted) || offers_external(features);
        advertised || self.workaround || !unneeded
    }

    fn restart_auth(
        &self,
        _packet: &Packet,
        conn: &Arc<Connection>,
        results: &mut Vec<Packet>,
    ) -> Result<(), S2sError> {
        self.init_dialback(conn, results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::S2sConfig;
    use crate::connection::ConnCommand;
    use crate::proc::test_support::{
        cid, db, drain, features, fixture, written, Fixture, TestHandler, LOCAL, REMOTE,
    };

    fn dialback_feature() -> Element {
        Element::with_ns("dialback", ns::DIALBACK_FEATURES)
    }

    fn sasl_external_feature() -> Element {
        Element::with_ns("mechanisms", ns::SASL)
            .with_child(Element::new("mechanism").with_text("EXTERNAL"))
    }

    #[test]
    fn initiator_sends_key_for_peer_stream() {
        let f = fixture();
        let (conn, _rx) = f.connect(cid());
        conn.set_session_id("peer-stream");
        let dispatch = f.pipeline.process_packet(features(vec![dialback_feature()]), &conn);

        let expected = dialback_key("s3cr3t", REMOTE, LOCAL, "peer-stream").unwrap();
        assert_eq!(
            dispatch.results[0].to_xml(),
            format!("<db:result from='local.test' to='remote.test'>{expected}</db:result>")
        );
        let ctx = conn.context();
        assert!(ctx.requested_result_domains.contains(REMOTE));
        assert_eq!(ctx.method_used, Some(AuthMethod::Dialback));
    }

    #[test]
    fn valid_result_authenticates_and_flushes() {
        let f = fixture();
        let (conn, mut rx) = f.connect(cid());
        conn.set_session_id("peer-stream");
        f.pipeline.process_packet(features(vec![dialback_feature()]), &conn);
        let cc = f.handler.cid_connections(&cid()).unwrap();
        cc.send_packet(crate::proc::test_support::stanza("message", "a@local.test", "b@remote.test"));

        let verdict = Packet::new(db("result", REMOTE, LOCAL).with_attr("type", "valid"));
        f.pipeline.process_packet(verdict, &conn);

        assert!(conn.is_authenticated_cid(&cid()));
        assert!(cc.is_negotiated(&conn));
        assert!(written(&mut rx).contains("<message"));
    }

    #[test]
    fn unsolicited_result_changes_nothing() {
        let f = fixture();
        let (conn, _rx) = f.connect(cid());
        let forged = Packet::new(db("result", REMOTE, LOCAL).with_attr("type", "valid"));
        f.pipeline.process_packet(forged, &conn);
        assert!(!conn.is_authenticated());
    }

    #[test]
    fn invalid_result_falls_back_then_stops() {
        let f = fixture();
        let (conn, mut rx) = f.connect(cid());
        conn.set_session_id("peer-stream");
        conn.context().tls = true;
        conn.context().cert_check = Some(CertCheckResult::SelfSigned);
        let offered = features(vec![dialback_feature(), sasl_external_feature()]);
        let dispatch = f.pipeline.process_packet(offered, &conn);
        assert_eq!(dispatch.results.len(), 1);
        assert!(conn.context().methods_available.contains(&AuthMethod::SaslExternal));

        let verdict = Packet::new(db("result", REMOTE, LOCAL).with_attr("type", "invalid"));
        let dispatch = f.pipeline.process_packet(verdict, &conn);
        assert!(dispatch.results[0].to_xml().contains("mechanism='EXTERNAL'"));
        assert_eq!(conn.context().method_used, Some(AuthMethod::SaslExternal));
        assert_eq!(f.pipeline.selector().failure_count(AuthMethod::Dialback, &cid()), 1);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn receiving_server_relays_key_over_side_connection() {
        let f = fixture();
        let (conn, _rx) = f.accept();
        conn.set_session_id("our-stream");
        let request = Packet::new(db("result", REMOTE, LOCAL).with_text("KEY"));
        let dispatch = f.pipeline.process_packet(request, &conn);
        assert!(dispatch.results.is_empty());

        let sent = f.handler.verify_results();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].side_connection);
        assert_eq!(
            sent[0].to_element().to_xml(),
            "<db:verify from='local.test' to='remote.test' id='our-stream'>KEY</db:verify>"
        );
        assert!(f.pipeline.dialback().pending().has_pending_for(&cid()));
        assert_eq!(conn.cid(), Some(cid()));
    }

    #[test]
    fn relay_refused_without_required_tls() {
        let f = Fixture::with_handler(TestHandler::new().tls_required(), S2sConfig::default());
        let (conn, _rx) = f.accept();
        conn.set_session_id("our-stream");
        let request = Packet::new(db("result", REMOTE, LOCAL).with_text("KEY"));
        let dispatch = f.pipeline.process_packet(request, &conn);
        assert_eq!(
            dispatch.results[0].to_xml(),
            "<db:result from='local.test' to='remote.test' type='error'><error type='cancel'>\
             <policy-violation xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></db:result>"
        );
        assert!(f.handler.verify_results().is_empty());
    }

    #[test]
    fn authoritative_server_checks_key() {
        let f = fixture();
        let (conn, _rx) = f.accept();
        let key = dialback_key("s3cr3t", REMOTE, LOCAL, "their-stream").unwrap();
        let good = Packet::new(
            db("verify", REMOTE, LOCAL)
                .with_attr("id", "their-stream")
                .with_text(key.clone()),
        );
        let dispatch = f.pipeline.process_packet(good, &conn);
        assert_eq!(
            dispatch.results[0].to_xml(),
            "<db:verify from='local.test' to='remote.test' id='their-stream' type='valid'/>"
        );

        let bad = Packet::new(db("verify", REMOTE, LOCAL).with_attr("id", "other").with_text(key));
        let dispatch = f.pipeline.process_packet(bad, &conn);
        assert!(dispatch.results[0].to_xml().contains("type='invalid'"));
        assert!(!conn.is_authenticated());
    }

    #[test]
    fn side_connection_sends_queued_requests_and_verdict_authenticates_origin() {
        let f = fixture();
        let (origin, mut origin_rx) = f.accept();
        origin.set_session_id("our-stream");
        f.handler.register_session(&origin);
        f.pipeline.process_packet(
            Packet::new(db("result", REMOTE, LOCAL).with_text("KEY")),
            &origin,
        );
        let cc = f.handler.cid_connections(&cid()).unwrap();
        let request = f.handler.verify_results()[0].to_element();
        cc.queue_verify_request(Packet::new(request));

        let (side, mut side_rx) = f.side_connection(cid());
        side.set_session_id("side-stream");
        let dispatch = f.pipeline.process_packet(features(vec![]), &side);
        assert_eq!(dispatch.results.len(), 1);
        assert!(side.context().handshaking_domains.contains(REMOTE));

        let verdict = Packet::new(
            db("verify", REMOTE, LOCAL)
                .with_attr("id", "our-stream")
                .with_attr("type", "valid"),
        );
        f.pipeline.process_packet(verdict, &side);

        assert!(origin.is_authenticated_cid(&cid()));
        assert!(written(&mut origin_rx).contains("<db:result from='local.test' to='remote.test' type='valid'/>"));
        assert_eq!(drain(&mut side_rx), vec![ConnCommand::Stop]);
        assert!(f.pipeline.dialback().pending().is_empty());
    }

    #[test]
    fn side_connection_closes_once_its_own_requests_are_answered() {
        let f = fixture();
        let mut origins = Vec::new();
        for session in ["s1", "s2"] {
            let (origin, rx) = f.accept();
            origin.set_session_id(session);
            f.handler.register_session(&origin);
            f.pipeline.process_packet(
                Packet::new(db("result", REMOTE, LOCAL).with_text("KEY")),
                &origin,
            );
            origins.push((origin, rx));
        }
        assert_eq!(f.pipeline.dialback().pending().len(), 2);

        // Only the first request travels on this side connection.
        let cc = f.handler.cid_connections(&cid()).unwrap();
        let request = f.handler.verify_results()[0].to_element();
        assert_eq!(request.attr("id"), Some("s1"));
        cc.queue_verify_request(Packet::new(request));

        let (side, mut side_rx) = f.side_connection(cid());
        f.pipeline.process_packet(features(vec![]), &side);
        let verdict = Packet::new(
            db("verify", REMOTE, LOCAL)
                .with_attr("id", "s1")
                .with_attr("type", "valid"),
        );
        f.pipeline.process_packet(verdict, &side);

        assert!(origins[0].0.is_authenticated_cid(&cid()));
        assert!(!origins[1].0.is_authenticated_cid(&cid()));
        assert_eq!(f.pipeline.dialback().pending().len(), 1);
        assert!(side.context().handshaking_domains.is_empty());
        assert!(drain(&mut side_rx).contains(&ConnCommand::Stop));
    }

    #[test]
    fn forged_verify_answer_is_ignored() {
        let f = fixture();
        let (origin, _rx) = f.accept();
        origin.set_session_id("our-stream");
        f.handler.register_session(&origin);
        let (side, _side_rx) = f.connect(cid());

        let forged = Packet::new(
            db("verify", REMOTE, LOCAL)
                .with_attr("id", "our-stream")
                .with_attr("type", "valid"),
        );
        f.pipeline.process_packet(forged, &side);
        assert!(!origin.is_authenticated());
        assert!(f.handler.verify_results().is_empty());
    }

    #[test]
    fn trusted_peer_without_dialback_is_authenticated_directly() {
        let f = fixture();
        let (conn, _rx) = f.connect(cid());
        conn.context().tls = true;
        conn.context().cert_check = Some(CertCheckResult::Trusted);
        let dispatch = f.pipeline.process_packet(features(vec![]), &conn);
        assert!(dispatch.results.is_empty());
        assert!(conn.is_authenticated_cid(&cid()));
        assert!(conn.context().negotiation_completed);
    }

    #[test]
    fn workaround_runs_dialback_for_trusted_peer() {
        let config = S2sConfig {
            dialback_workaround: true,
            ..S2sConfig::default()
        };
        let f = Fixture::with_config(config);
        let (conn, _rx) = f.connect(cid());
        conn.set_session_id("peer-stream");
        conn.context().cert_check = Some(CertCheckResult::Trusted);
        let dispatch = f.pipeline.process_packet(features(vec![]), &conn);
        assert!(dispatch.results[0].to_xml().starts_with("<db:result"));
        assert!(!conn.is_authenticated());
    }

    #[test]
    fn dialback_waits_for_offered_tls() {
        let f = fixture();
        let (conn, _rx) = f.connect(cid());
        let stage = Dialback::new(f.handler.clone(), f.pipeline.selector().clone(), false);
        let offer = features(vec![Element::with_ns("starttls", ns::TLS), dialback_feature()]);
        assert!(!stage.can_handle(&offer, &conn));
    }

    #[test]
    fn dialback_proceeds_over_plain_tcp_without_certificate() {
        let f = Fixture::with_handler(TestHandler::new().without_tls(), S2sConfig::default());
        let (conn, _rx) = f.connect(cid());
        let stage = Dialback::new(f.handler.clone(), f.pipeline.selector().clone(), false);
        let offer = features(vec![Element::with_ns("starttls", ns::TLS), dialback_feature()]);
        assert!(stage.can_handle(&offer, &conn));
    }

    #[test]
    fn legacy_outgoing_stream_starts_dialback_on_open() {
        let f = fixture();
        let (conn, mut rx) = f.connect(cid());
        let header = StreamHeader::new()
            .with_attr("from", REMOTE)
            .with_attr("to", LOCAL)
            .with_attr("id", "legacy-id");
        f.pipeline.stream_opened(&conn, &header);
        assert!(written(&mut rx).starts_with("<db:result from='local.test' to='remote.test'>"));
    }

    #[test]
    fn features_advertise_dialback() {
        let f = fixture();
        let (conn, _rx) = f.accept();
        let offered = f.pipeline.stream_features(&conn);
        let dialback = offered.child("dialback", ns::DIALBACK_FEATURES).unwrap();
        assert!(dialback.child_named("errors").is_some());
        assert!(dialback.child_named("required").is_some());
        assert!(conn.context().methods_available.contains(&AuthMethod::Dialback));

        conn.context().cert_check = Some(CertCheckResult::Trusted);
        let offered = f.pipeline.stream_features(&conn);
        assert!(offered
            .child("dialback", ns::DIALBACK_FEATURES)
            .unwrap()
            .child_named("required")
            .is_none());
    }

    #[test]
    fn missing_addressing_is_improper() {
        let f = fixture();
        let (conn, mut rx) = f.accept();
        let bad = Packet::new(Element::prefixed("db:result", ns::DIALBACK).with_text("KEY"));
        f.pipeline.process_packet(bad, &conn);
        assert!(written(&mut rx).contains("<improper-addressing"));
        assert!(conn.is_stopped());
    }
}
