//! In-memory handler and fixtures for stage tests.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::Pipeline;
use crate::cid::Cid;
use crate::cid_connections::CidConnections;
use crate::config::S2sConfig;
use crate::connection::{ConnCommand, Connection, ConnectionType};
use crate::dns::IpLookup;
use crate::error::S2sError;
use crate::handler::{S2sHandler, TimerHandle, TimerTask, VerifyResult};
use crate::packet::Packet;
use crate::xml::{ns, Element};

pub(crate) const LOCAL: &str = "local.test";
pub(crate) const REMOTE: &str = "remote.test";

pub(crate) struct TestHandler {
    local_domains: HashSet<String>,
    secrets: HashMap<String, String>,
    tls_required: bool,
    tls_available: bool,
    skip_tls: HashSet<String>,
    cid_conns: Mutex<HashMap<Cid, Arc<CidConnections>>>,
    timers: Mutex<Vec<(Duration, Option<TimerTask>, TimerHandle)>>,
    verify_results: Mutex<Vec<VerifyResult>>,
    sessions: Mutex<HashMap<String, Arc<Connection>>>,
}

impl TestHandler {
    pub fn new() -> Self {
        Self {
            local_domains: [LOCAL.to_string()].into_iter().collect(),
            secrets: [(LOCAL.to_string(), "s3cr3t".to_string())].into_iter().collect(),
            tls_required: false,
            tls_available: true,
            skip_tls: HashSet::new(),
            cid_conns: Mutex::new(HashMap::new()),
            timers: Mutex::new(Vec::new()),
            verify_results: Mutex::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn without_secrets() -> Self {
        Self {
            secrets: HashMap::new(),
            ..Self::new()
        }
    }

    pub fn tls_required(mut self) -> Self {
        self.tls_required = true;
        self
    }

    pub fn without_tls(mut self) -> Self {
        self.tls_available = false;
        self
    }

    pub fn skip_tls_for(mut self, host: &str) -> Self {
        self.skip_tls.insert(host.to_string());
        self
    }

    pub fn cid_connections(&self, cid: &Cid) -> Option<Arc<CidConnections>> {
        self.cid_conns.lock().get(cid).cloned()
    }

    pub fn register_session(&self, conn: &Arc<Connection>) {
        if let Some(id) = conn.session_id() {
            self.sessions.lock().insert(id, conn.clone());
        }
    }

    pub fn verify_results(&self) -> Vec<VerifyResult> {
        self.verify_results.lock().clone()
    }

    pub fn timer_count(&self) -> usize {
        self.timers.lock().len()
    }

    /// Run every scheduled task whose handle was not cancelled.
    pub fn fire_timers(&self) {
        let tasks: Vec<_> = self
            .timers
            .lock()
            .iter_mut()
            .filter_map(|(_, task, handle)| task.take().map(|t| (t, handle.clone())))
            .collect();
        for (task, handle) in tasks {
            if !handle.is_cancelled() {
                task();
            }
        }
    }
}

impl S2sHandler for TestHandler {
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
        let mut map = self.cid_conns.lock();
        if let Some(cc) = map.get(cid) {
            return Ok(Some(cc.clone()));
        }
        if !create {
            return Ok(None);
        }
        let cc = Arc::new(CidConnections::new(cid.clone(), 4));
        map.insert(cid.clone(), cc.clone());
        Ok(Some(cc))
    }

    fn secret_for_domain(&self, domain: &str) -> Result<String, S2sError> {
        self.secrets
            .get(domain)
            .cloned()
            .ok_or_else(|| S2sError::MissingSecret(domain.to_string()))
    }

    fn is_tls_required(&self, _domain: &str) -> bool {
        self.tls_required
    }

    fn skip_tls_for_host(&self, host: &str) -> bool {
        self.skip_tls.contains(host)
    }

    fn tls_available(&self) -> bool {
        self.tls_available
    }

    fn is_local_domain(&self, domain: &str) -> bool {
        self.local_domains.contains(domain)
    }

    fn add_timer_task(&self, task: TimerTask, delay: Duration) -> TimerHandle {
        let handle = TimerHandle::new();
        self.timers.lock().push((delay, Some(task), handle.clone()));
        handle
    }

    fn auth_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn send_verify_result(&self, result: VerifyResult) -> bool {
        if !result.side_connection {
            let target = result
                .session_id
                .as_deref()
                .and_then(|s| self.connection_for_session(s));
            if let Some(conn) = target {
                conn.send_packet(&Packet::new(result.to_element()));
            }
        }
        self.verify_results.lock().push(result);
        true
    }

    fn connection_for_session(&self, session_id: &str) -> Option<Arc<Connection>> {
        self.sessions.lock().get(session_id).cloned()
    }
}

/// Fixed address table standing in for the resolver cache.
#[derive(Default)]
pub(crate) struct StaticIps {
    entries: Mutex<HashMap<String, Vec<IpAddr>>>,
}

impl StaticIps {
    pub fn insert(&self, domain: &str, ips: Vec<IpAddr>) {
        self.entries.lock().insert(domain.to_string(), ips);
    }
}

impl IpLookup for StaticIps {
    fn cached_ips(&self, domain: &str) -> Option<Vec<IpAddr>> {
        self.entries.lock().get(domain).cloned()
    }
}

pub(crate) struct Fixture {
    pub handler: Arc<TestHandler>,
    pub ips: Arc<StaticIps>,
    pub pipeline: Pipeline,
}

impl Fixture {
    pub fn with_handler(handler: TestHandler, config: S2sConfig) -> Self {
        let handler = Arc::new(handler);
        let ips = Arc::new(StaticIps::default());
        let pipeline = Pipeline::new(handler.clone(), &config, ips.clone());
        Self {
            handler,
            ips,
            pipeline,
        }
    }

    pub fn with_config(config: S2sConfig) -> Self {
        Self::with_handler(TestHandler::new(), config)
    }

    pub fn accept(&self) -> (Arc<Connection>, mpsc::UnboundedReceiver<ConnCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Connection::new(ConnectionType::Accept, Some(([10, 0, 0, 2], 40000).into()), tx),
            rx,
        )
    }

    /// Outgoing connection registered as handshaking for `cid`.
    pub fn connect(&self, cid: Cid) -> (Arc<Connection>, mpsc::UnboundedReceiver<ConnCommand>) {
        self.outgoing(cid, false)
    }

    pub fn side_connection(&self, cid: Cid) -> (Arc<Connection>, mpsc::UnboundedReceiver<ConnCommand>) {
        self.outgoing(cid, true)
    }

    fn outgoing(&self, cid: Cid, handshaking_only: bool) -> (Arc<Connection>, mpsc::UnboundedReceiver<ConnCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::outgoing(
            cid.clone(),
            handshaking_only,
            Some(([10, 0, 0, 3], 5269).into()),
            tx,
        );
        if let Ok(Some(cc)) = self.handler.get_cid_connections(&cid, true) {
            cc.add_outgoing_handshaking(&conn);
        }
        (conn, rx)
    }
}

pub(crate) fn fixture() -> Fixture {
    Fixture::with_handler(TestHandler::new(), S2sConfig::default())
}

pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<ConnCommand>) -> Vec<ConnCommand> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

/// Every written string, concatenated.
pub(crate) fn written(rx: &mut mpsc::UnboundedReceiver<ConnCommand>) -> String {
    drain(rx)
        .into_iter()
        .filter_map(|c| match c {
            ConnCommand::Write(x) | ConnCommand::StreamOpen(x) => Some(x),
            _ => None,
        })
        .collect()
}

pub(crate) fn features(children: Vec<Element>) -> Packet {
    Packet::new(
        children
            .into_iter()
            .fold(Element::prefixed("stream:features", ns::STREAMS), |f, c| f.with_child(c)),
    )
}

pub(crate) fn stanza(name: &str, from: &str, to: &str) -> Packet {
    Packet::new(
        Element::prefixed(name, ns::SERVER)
            .with_attr("from", from)
            .with_attr("to", to),
    )
}

pub(crate) fn db(name: &str, from: &str, to: &str) -> Element {
    Element::prefixed(format!("db:{name}"), ns::DIALBACK)
        .with_attr("from", from)
        .with_attr("to", to)
}

pub(crate) fn cid() -> Cid {
    Cid::new(LOCAL, REMOTE)
}
