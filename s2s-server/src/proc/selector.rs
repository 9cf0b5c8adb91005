//! Arbitration between the authentication mechanisms of one connection.
//!
//! Each connection carries a set of methods known to be usable and a
//! single slot for the method currently authenticating (both live in
//! [`crate::connection::ConnectionContext`]). A mechanism asks
//! [`AuthenticatorSelectorManager::is_allowed`] before it starts, reports
//! failure through [`AuthenticatorSelectorManager::authentication_failed`]
//! and success through
//! [`AuthenticatorSelectorManager::authenticate_connection`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::{AuthMethod, S2sProcessor};
use crate::cid::Cid;
use crate::cid_connections::CidConnections;
use crate::connection::Connection;
use crate::error::S2sError;
use crate::handler::S2sHandler;
use crate::packet::Packet;

/// A stage that can authenticate a connection.
pub trait AuthenticationProcessor: S2sProcessor {
    fn method(&self) -> AuthMethod;

    fn method_name(&self) -> &'static str {
        self.method().name()
    }

    /// Whether this mechanism could run in response to `packet`.
    /// Must not have side effects.
    fn can_handle(&self, packet: &Packet, conn: &Arc<Connection>) -> bool;

    /// Start over on `conn` after another mechanism failed.
    fn restart_auth(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        results: &mut Vec<Packet>,
    ) -> Result<(), S2sError>;
}

enum FailureOutcome {
    Exhausted,
    Restart(AuthMethod),
    AwaitPeer,
}

pub struct AuthenticatorSelectorManager {
    handler: Arc<dyn S2sHandler>,
    processors: RwLock<Vec<Weak<dyn AuthenticationProcessor>>>,
    failures: Mutex<HashMap<(AuthMethod, Cid), u64>>,
}

impl AuthenticatorSelectorManager {
    pub fn new(handler: Arc<dyn S2sHandler>) -> Self {
        Self {
            handler,
            processors: RwLock::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, processor: &Arc<dyn AuthenticationProcessor>) {
        self.processors.write().push(Arc::downgrade(processor));
    }

    fn processor(&self, method: AuthMethod) -> Option<Arc<dyn AuthenticationProcessor>> {
        self.processors
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|p| p.method() == method)
    }

    /// Whether `stage` may start authenticating `conn` now.
    ///
    /// A stage that can handle the packet joins the connection's available
    /// set either way; it only gets the in-flight slot when that slot is
    /// empty.
    pub fn is_allowed(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        stage: &dyn AuthenticationProcessor,
    ) -> bool {
        if conn.is_authenticated() {
            return false;
        }
        if !stage.can_handle(packet, conn) {
            return false;
        }
        let method = stage.method();
        let mut ctx = conn.context();
        ctx.methods_available.insert(method);
        if let Some(current) = ctx.method_used {
            tracing::debug!(
                session_id = ?conn.session_id(),
                method = method.name(),
                current = current.name(),
                "Authentication already in progress"
            );
            return false;
        }
        ctx.method_used = Some(method);
        ctx.methods_available.remove(&method);
        tracing::debug!(session_id = ?conn.session_id(), method = method.name(), "Authentication method selected");
        true
    }

    /// Claim the in-flight slot without feature negotiation (legacy
    /// streams start dialback straight away).
    pub fn claim(&self, conn: &Connection, method: AuthMethod) -> bool {
        if conn.is_authenticated() {
            return false;
        }
        let mut ctx = conn.context();
        if ctx.method_used.is_some() {
            return false;
        }
        ctx.method_used = Some(method);
        true
    }

    /// Record that `method` failed on `conn` and fall back or give up.
    ///
    /// With no method left the queued output (including `results`) is
    /// flushed and the connection is force-stopped. Outgoing connections
    /// restart with the next method by priority; incoming ones wait for
    /// the peer to try something else.
    pub fn authentication_failed(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        method: AuthMethod,
        results: &mut Vec<Packet>,
    ) {
        let cid = conn.cid();
        if let Some(cid) = &cid {
            *self.failures.lock().entry((method, cid.clone())).or_insert(0) += 1;
        }

        let outcome = {
            let mut ctx = conn.context();
            ctx.methods_available.remove(&method);
            if ctx.method_used == Some(method) {
                ctx.method_used = None;
            }
            if ctx.methods_available.is_empty() {
                FailureOutcome::Exhausted
            } else if conn.is_connect() {
                match ctx.methods_available.iter().next().copied() {
                    Some(next) => {
                        ctx.methods_available.remove(&next);
                        ctx.method_used = Some(next);
                        FailureOutcome::Restart(next)
                    }
                    None => FailureOutcome::Exhausted,
                }
            } else {
                FailureOutcome::AwaitPeer
            }
        };

        match outcome {
            FailureOutcome::Exhausted => {
                tracing::warn!(
                    cid = ?cid,
                    session_id = ?conn.session_id(),
                    method = method.name(),
                    "Authentication failed and no method left, closing"
                );
                for p in results.drain(..) {
                    conn.add_packet_to_send(p);
                }
                conn.process_waiting_packets();
                conn.force_stop();
            }
            FailureOutcome::Restart(next) => {
                tracing::info!(
                    cid = ?cid,
                    session_id = ?conn.session_id(),
                    failed = method.name(),
                    next = next.name(),
                    "Falling back to next authentication method"
                );
                let restarted = match self.processor(next) {
                    Some(p) => p.restart_auth(packet, conn, results),
                    None => Err(S2sError::MethodUnavailable(next.name())),
                };
                if let Err(e) = restarted {
                    tracing::warn!(method = next.name(), error = %e, "Restarting authentication failed");
                    self.authentication_failed(packet, conn, next, results);
                }
            }
            FailureOutcome::AwaitPeer => {
                tracing::debug!(
                    cid = ?cid,
                    session_id = ?conn.session_id(),
                    method = method.name(),
                    "Authentication failed, waiting for the peer to try another method"
                );
            }
        }
    }

    /// Shared success path: clear the in-flight slot and mark `cid`
    /// authenticated on `conn`. Returns `false` when it already was.
    pub fn authenticate_connection(
        &self,
        conn: &Arc<Connection>,
        cid_conns: &CidConnections,
        cid: &Cid,
    ) -> bool {
        conn.context().method_used = None;
        cid_conns.connection_authenticated(conn, cid)
    }

    /// Like [`Self::authenticate_connection`], resolving the aggregate for
    /// `cid` through the handler.
    pub fn authenticate_cid(&self, conn: &Arc<Connection>, cid: &Cid) -> Result<bool, S2sError> {
        let cid_conns = self
            .handler
            .get_cid_connections(cid, true)?
            .ok_or(S2sError::MissingCid)?;
        Ok(self.authenticate_connection(conn, &cid_conns, cid))
    }

    pub fn failure_count(&self, method: AuthMethod, cid: &Cid) -> u64 {
        self.failures
            .lock()
            .get(&(method, cid.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of the per (method, CID) failure counters.
    pub fn failure_counters(&self) -> Vec<(AuthMethod, Cid, u64)> {
        let mut out: Vec<_> = self
            .failures
            .lock()
            .iter()
            .map(|((m, c), n)| (*m, c.clone(), *n))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnCommand;
    use crate::proc::StageOrder;
    use crate::proc::test_support::{drain, TestHandler};
    use crate::xml::Element;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fake {
        method: AuthMethod,
        capable: bool,
        restarts: AtomicUsize,
    }

    impl Fake {
        fn new(method: AuthMethod, capable: bool) -> Arc<Self> {
            Arc::new(Self {
                method,
                capable,
                restarts: AtomicUsize::new(0),
            })
        }
    }

    impl S2sProcessor for Fake {
        fn order(&self) -> StageOrder {
            match self.method {
                AuthMethod::Dialback => StageOrder::Dialback,
                AuthMethod::SaslExternal => StageOrder::SaslExternal,
            }
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    impl AuthenticationProcessor for Fake {
        fn method(&self) -> AuthMethod {
            self.method
        }

        fn can_handle(&self, _packet: &Packet, _conn: &Arc<Connection>) -> bool {
            self.capable
        }

        fn restart_auth(
            &self,
            _packet: &Packet,
            _conn: &Arc<Connection>,
            results: &mut Vec<Packet>,
        ) -> Result<(), S2sError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            results.push(Packet::new(Element::new("restarted")));
            Ok(())
        }
    }

    fn setup() -> (AuthenticatorSelectorManager, Arc<Fake>, Arc<Fake>) {
        let selector = AuthenticatorSelectorManager::new(Arc::new(TestHandler::new()));
        let dialback = Fake::new(AuthMethod::Dialback, true);
        let sasl = Fake::new(AuthMethod::SaslExternal, true);
        let d: Arc<dyn AuthenticationProcessor> = dialback.clone();
        let s: Arc<dyn AuthenticationProcessor> = sasl.clone();
        selector.register(&d);
        selector.register(&s);
        (selector, dialback, sasl)
    }

    fn outgoing() -> (Arc<Connection>, tokio::sync::mpsc::UnboundedReceiver<ConnCommand>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Connection::outgoing(Cid::new("local.test", "remote.test"), false, None, tx), rx)
    }

    fn packet() -> Packet {
        Packet::new(Element::new("stream:features"))
    }

    #[test]
    fn only_one_method_in_flight() {
        let (selector, dialback, sasl) = setup();
        let (conn, _rx) = outgoing();
        assert!(selector.is_allowed(&packet(), &conn, dialback.as_ref()));
        assert!(!selector.is_allowed(&packet(), &conn, sasl.as_ref()));

        let ctx = conn.context();
        assert_eq!(ctx.method_used, Some(AuthMethod::Dialback));
        assert!(ctx.methods_available.contains(&AuthMethod::SaslExternal));
        assert!(!ctx.methods_available.contains(&AuthMethod::Dialback));
    }

    #[test]
    fn incapable_stage_is_not_recorded() {
        let selector = AuthenticatorSelectorManager::new(Arc::new(TestHandler::new()));
        let dialback = Fake::new(AuthMethod::Dialback, false);
        let (conn, _rx) = outgoing();
        assert!(!selector.is_allowed(&packet(), &conn, dialback.as_ref()));
        assert!(conn.context().methods_available.is_empty());
        assert_eq!(conn.context().method_used, None);
    }

    #[test]
    fn authenticated_connection_is_never_allowed() {
        let (selector, dialback, _) = setup();
        let (conn, _rx) = outgoing();
        conn.add_cid(Cid::new("local.test", "remote.test"));
        assert!(!selector.is_allowed(&packet(), &conn, dialback.as_ref()));
    }

    #[test]
    fn outgoing_failure_restarts_next_method() {
        let (selector, dialback, sasl) = setup();
        let (conn, _rx) = outgoing();
        selector.is_allowed(&packet(), &conn, dialback.as_ref());
        selector.is_allowed(&packet(), &conn, sasl.as_ref());

        let mut results = Vec::new();
        selector.authentication_failed(&packet(), &conn, AuthMethod::Dialback, &mut results);

        assert_eq!(sasl.restarts.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 1);
        assert_eq!(conn.context().method_used, Some(AuthMethod::SaslExternal));
        assert!(!conn.is_stopped());
        let cid = Cid::new("local.test", "remote.test");
        assert_eq!(selector.failure_count(AuthMethod::Dialback, &cid), 1);
    }

    #[test]
    fn exhausted_methods_flush_then_force_stop() {
        let (selector, dialback, sasl) = setup();
        let (conn, mut rx) = outgoing();
        selector.is_allowed(&packet(), &conn, dialback.as_ref());
        selector.is_allowed(&packet(), &conn, sasl.as_ref());

        let mut results = Vec::new();
        selector.authentication_failed(&packet(), &conn, AuthMethod::Dialback, &mut results);
        conn.add_packet_to_send(Packet::new(Element::new("pending")));
        selector.authentication_failed(&packet(), &conn, AuthMethod::SaslExternal, &mut results);

        assert!(results.is_empty());
        let cmds = drain(&mut rx);
        assert_eq!(
            cmds,
            vec![
                ConnCommand::Write("<pending/>".into()),
                ConnCommand::Write("<restarted/>".into()),
                ConnCommand::ForceStop,
            ]
        );
        let cid = Cid::new("local.test", "remote.test");
        assert_eq!(selector.failure_count(AuthMethod::SaslExternal, &cid), 1);
        assert_eq!(selector.failure_counters().len(), 2);
    }

    #[test]
    fn incoming_failure_waits_for_peer() {
        let (selector, _, _) = setup();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = Connection::new(crate::connection::ConnectionType::Accept, None, tx);
        {
            let mut ctx = conn.context();
            ctx.methods_available.insert(AuthMethod::Dialback);
            ctx.methods_available.insert(AuthMethod::SaslExternal);
        }
        let mut results = Vec::new();
        selector.authentication_failed(&packet(), &conn, AuthMethod::SaslExternal, &mut results);
        assert!(drain(&mut rx).is_empty());
        assert!(conn.context().methods_available.contains(&AuthMethod::Dialback));
    }

    #[test]
    fn authenticate_clears_slot_once() {
        let (selector, dialback, _) = setup();
        let (conn, _rx) = outgoing();
        let cid = Cid::new("local.test", "remote.test");
        let cc = CidConnections::new(cid.clone(), 4);
        selector.is_allowed(&packet(), &conn, dialback.as_ref());
        assert!(selector.authenticate_connection(&conn, &cc, &cid));
        assert_eq!(conn.context().method_used, None);
        assert!(!selector.authenticate_connection(&conn, &cc, &cid));
        assert!(conn.is_authenticated_cid(&cid));
    }

    #[test]
    fn legacy_claim_respects_in_flight_slot() {
        let (selector, _, _) = setup();
        let (conn, _rx) = outgoing();
        assert!(selector.claim(&conn, AuthMethod::Dialback));
        assert!(!selector.claim(&conn, AuthMethod::SaslExternal));
    }
}
