//! Shared server state: the production [`S2sHandler`].
//!
//! Owns the CID registry, the accept-side session registry, dialback
//! secrets and timers, and turns dialback relays and outbound stanzas into
//! requests for new outgoing connections.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::cid::Cid;
use crate::cid_connections::CidConnections;
use crate::config::S2sConfig;
use crate::connection::Connection;
use crate::error::S2sError;
use crate::handler::{S2sHandler, TimerHandle, TimerTask, VerifyResult};
use crate::packet::Packet;
use crate::proc::{AuthMethod, Pipeline};

/// Request for the connector to open an outgoing stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub cid: Cid,
    /// Carry dialback verifications only.
    pub handshaking_only: bool,
}

/// Point-in-time counters for the periodic statistics line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S2sStats {
    pub cids: usize,
    pub incoming: usize,
    pub outgoing: usize,
    pub handshaking: usize,
    pub waiting_packets: usize,
    pub sessions: usize,
    pub pending_verifications: usize,
    pub failures: Vec<(AuthMethod, Cid, u64)>,
}

pub struct S2sState {
    config: S2sConfig,
    secrets: HashMap<String, String>,
    tls_available: bool,
    cid_conns: RwLock<HashMap<Cid, Arc<CidConnections>>>,
    sessions: RwLock<HashMap<String, Weak<Connection>>>,
    connect_tx: mpsc::UnboundedSender<ConnectRequest>,
}

impl S2sState {
    /// Build the state. Local domains without a configured secret get a
    /// random one, valid for the life of the process.
    pub fn new(
        config: S2sConfig,
        configured_secrets: &HashMap<String, String>,
        tls_available: bool,
        connect_tx: mpsc::UnboundedSender<ConnectRequest>,
    ) -> Self {
        let secrets = config
            .local_domains
            .iter()
            .map(|domain| {
                let secret = configured_secrets
                    .get(domain)
                    .cloned()
                    .unwrap_or_else(|| hex::encode(rand::random::<[u8; 32]>()));
                (domain.clone(), secret)
            })
            .collect();
        Self {
            config,
            secrets,
            tls_available,
            cid_conns: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            connect_tx,
        }
    }

    pub fn config(&self) -> &S2sConfig {
        &self.config
    }

    /// Make an accept-side stream reachable by its stream id.
    pub fn register_session(&self, conn: &Arc<Connection>) {
        if let Some(id) = conn.session_id() {
            self.sessions.write().insert(id, Arc::downgrade(conn));
        }
    }

    /// Drop every session id pointing at `conn` (a reopened stream
    /// leaves its earlier ids behind).
    pub fn unregister_session(&self, conn: &Connection) {
        self.sessions
            .write()
            .retain(|_, weak| weak.upgrade().is_some_and(|c| c.id() != conn.id()));
    }

    /// Queue an outbound stanza for its remote domain, requesting an
    /// outgoing connection if none can carry it yet.
    pub fn send_packet(&self, packet: Packet) -> Result<(), S2sError> {
        let (Some(from), Some(to)) = (packet.from_domain(), packet.to_domain()) else {
            return Err(S2sError::Unaddressed);
        };
        let cid = Cid::new(from, to);
        let cc = self
            .get_cid_connections(&cid, true)?
            .ok_or(S2sError::MissingCid)?;
        if cc.send_packet(packet) {
            tracing::debug!(cid = %cid, "Requesting outgoing connection");
            self.request_connection(cid, false);
        }
        Ok(())
    }

    fn request_connection(&self, cid: Cid, handshaking_only: bool) -> bool {
        self.connect_tx
            .send(ConnectRequest {
                cid,
                handshaking_only,
            })
            .is_ok()
    }

    /// Drop CID aggregates with no connections and nothing queued or pending.
    pub fn prune_idle(&self) -> usize {
        let mut map = self.cid_conns.write();
        let before = map.len();
        map.retain(|_, cc| !cc.is_idle());
        before - map.len()
    }

    pub fn stats(&self, pipeline: &Pipeline) -> S2sStats {
        let map = self.cid_conns.read();
        let mut stats = S2sStats {
            cids: map.len(),
            sessions: self.sessions.read().len(),
            pending_verifications: pipeline.dialback().pending().len(),
            failures: pipeline.selector().failure_counters(),
            ..Default::default()
        };
        for cc in map.values() {
            stats.incoming += cc.incoming_count();
            stats.outgoing += cc.outgoing_count();
            stats.handshaking += cc.handshaking_count();
            stats.waiting_packets += cc.waiting_count();
        }
        stats
    }
}

impl S2sHandler for S2sState {
    fn get_cid_connections(
        &self,
        cid: &Cid,
        create: bool,
    ) -> Result<Option<Arc<CidConnections>>, S2sError> {
        if !self.is_local_domain(cid.local_host()) {
            return Err(S2sError::NotLocalhost(cid.local_host().to_string()));
        }
        if self.is_local_domain(cid.remote_host()) {
            return Err(S2sError::Localhost(cid.remote_host().to_string()));
        }
        if let Some(cc) = self.cid_conns.read().get(cid) {
            return Ok(Some(cc.clone()));
        }
        if !create {
            return Ok(None);
        }
        let cc = self
            .cid_conns
            .write()
            .entry(cid.clone())
            .or_insert_with(|| Arc::new(CidConnections::new(cid.clone(), self.config.max_out_conns)))
            .clone();
        Ok(Some(cc))
    }

    fn secret_for_domain(&self, domain: &str) -> Result<String, S2sError> {
        self.secrets
            .get(domain)
            .cloned()
            .ok_or_else(|| S2sError::MissingSecret(domain.to_string()))
    }

    fn is_tls_required(&self, _domain: &str) -> bool {
        self.config.tls_required
    }

    fn skip_tls_for_host(&self, host: &str) -> bool {
        self.config.skip_tls_hosts.contains(host)
    }

    fn tls_available(&self) -> bool {
        self.tls_available
    }

    fn is_local_domain(&self, domain: &str) -> bool {
        self.config.local_domains.contains(domain)
    }

    fn add_timer_task(&self, task: TimerTask, delay: Duration) -> TimerHandle {
        let handle = TimerHandle::new();
        let armed = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !armed.is_cancelled() {
                task();
            }
        });
        handle
    }

    fn auth_timeout(&self) -> Duration {
        self.config.auth_timeout
    }

    fn send_verify_result(&self, result: VerifyResult) -> bool {
        let packet = Packet::new(result.to_element());
        if result.side_connection {
            let cc = match self.get_cid_connections(&result.cid_packet, true) {
                Ok(Some(cc)) => cc,
                Ok(None) => return false,
                Err(e) => {
                    tracing::warn!(cid = %result.cid_packet, error = %e, "Cannot relay dialback verify");
                    return false;
                }
            };
            cc.queue_verify_request(packet);
            return self.request_connection(result.cid_packet, true);
        }

        let target = result
            .session_id
            .as_deref()
            .and_then(|id| self.connection_for_session(id));
        match target {
            Some(conn) => {
                conn.send_packet(&packet);
                true
            }
            None => {
                tracing::debug!(
                    cid = %result.cid_packet,
                    session_id = ?result.session_id,
                    "No stream for dialback result"
                );
                false
            }
        }
    }

    fn connection_for_session(&self, session_id: &str) -> Option<Arc<Connection>> {
        self.sessions
            .read()
            .get(session_id)
            .and_then(Weak::upgrade)
            .filter(|c| !c.is_stopped())
    }
}
