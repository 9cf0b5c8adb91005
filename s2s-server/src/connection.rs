//! One physical S2S stream and its typed per-connection state.
//!
//! A [`Connection`] never touches the socket itself. Everything a stage
//! wants done on the wire is turned into a [`ConnCommand`] and queued on an
//! unbounded channel that the transport driver drains in order, so commands
//! issued while a stanza is being processed reach the socket in the order
//! they were issued.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;

use crate::cid::Cid;
use crate::handler::TimerHandle;
use crate::packet::Packet;
use crate::proc::AuthMethod;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Who opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// The peer connected to us.
    Accept,
    /// We connected to the peer.
    Connect,
}

/// Trust classification of the peer certificate after a TLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertCheckResult {
    /// Chains to a configured trust anchor and matches the peer domain.
    Trusted,
    SelfSigned,
    /// Presented but not verifiable against our anchors.
    Untrusted,
    /// Expired, malformed or otherwise unusable.
    Invalid,
    /// The peer presented no certificate.
    Missing,
}

impl CertCheckResult {
    /// A certificate was presented and is at least structurally usable.
    pub fn is_presented(&self) -> bool {
        matches!(self, Self::Trusted | Self::SelfSigned | Self::Untrusted)
    }
}

/// Work for the transport driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnCommand {
    Write(String),
    /// Write a fresh stream header and expect a new stream from the peer.
    StreamOpen(String),
    StartTls {
        client_mode: bool,
        want_client_auth: bool,
        need_client_auth: bool,
    },
    /// Flush queued output, close the stream and the socket.
    Stop,
    /// Drop the socket immediately.
    ForceStop,
}

/// Typed per-connection state.
#[derive(Debug, Default)]
pub struct ConnectionContext {
    /// Domain pair this stream was opened for.
    pub cid: Option<Cid>,
    /// Local domain the peer addressed.
    pub hostname: Option<String>,
    /// `version` from the peer's stream header; absent on legacy streams.
    pub version: Option<String>,
    pub tls: bool,
    pub cert_check: Option<CertCheckResult>,
    /// Authentication methods known to be usable on this connection.
    pub methods_available: BTreeSet<AuthMethod>,
    /// Method currently authenticating, if any.
    pub method_used: Option<AuthMethod>,
    /// Remote domains we sent an untyped `<db:result>` for.
    pub requested_result_domains: HashSet<String>,
    /// Remote domains with a `<db:verify>` in flight on this connection.
    pub handshaking_domains: BTreeSet<String>,
    /// `(remote domain, stream id)` of each `<db:verify>` sent here.
    pub verify_ids: BTreeSet<(String, String)>,
    /// Outgoing connection opened only to carry dialback verifications.
    pub handshaking_only: bool,
    pub negotiation_completed: bool,
    pub auth_timer: Option<TimerHandle>,
}

/// One accept or connect stream.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    conn_type: ConnectionType,
    remote_addr: Option<SocketAddr>,
    session_id: RwLock<Option<String>>,
    context: Mutex<ConnectionContext>,
    cids: Mutex<BTreeSet<Cid>>,
    peer_certificate: RwLock<Option<Vec<u8>>>,
    waiting: Mutex<VecDeque<Packet>>,
    stopped: AtomicBool,
    tx: mpsc::UnboundedSender<ConnCommand>,
}

impl Connection {
    pub fn new(
        conn_type: ConnectionType,
        remote_addr: Option<SocketAddr>,
        tx: mpsc::UnboundedSender<ConnCommand>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            conn_type,
            remote_addr,
            session_id: RwLock::new(None),
            context: Mutex::new(ConnectionContext::default()),
            cids: Mutex::new(BTreeSet::new()),
            peer_certificate: RwLock::new(None),
            waiting: Mutex::new(VecDeque::new()),
            stopped: AtomicBool::new(false),
            tx,
        })
    }

    /// Outgoing connection bound to `cid` before its stream opens.
    pub fn outgoing(
        cid: Cid,
        handshaking_only: bool,
        remote_addr: Option<SocketAddr>,
        tx: mpsc::UnboundedSender<ConnCommand>,
    ) -> Arc<Self> {
        let conn = Self::new(ConnectionType::Connect, remote_addr, tx);
        {
            let mut ctx = conn.context();
            ctx.hostname = Some(cid.local_host().to_string());
            ctx.cid = Some(cid);
            ctx.handshaking_only = handshaking_only;
        }
        conn
    }

    /// Process-unique id, stable for the life of the connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.conn_type
    }

    pub fn is_accept(&self) -> bool {
        self.conn_type == ConnectionType::Accept
    }

    pub fn is_connect(&self) -> bool {
        self.conn_type == ConnectionType::Connect
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn set_session_id(&self, id: impl Into<String>) {
        *self.session_id.write() = Some(id.into());
    }

    /// Lock the typed session state. Never hold the guard across a call
    /// that may lock it again.
    pub fn context(&self) -> MutexGuard<'_, ConnectionContext> {
        self.context.lock()
    }

    pub fn cid(&self) -> Option<Cid> {
        self.context.lock().cid.clone()
    }

    /// Authenticated for at least one CID.
    pub fn is_authenticated(&self) -> bool {
        !self.cids.lock().is_empty()
    }

    pub fn is_authenticated_cid(&self, cid: &Cid) -> bool {
        self.cids.lock().contains(cid)
    }

    pub fn cids(&self) -> Vec<Cid> {
        self.cids.lock().iter().cloned().collect()
    }

    /// Mark `cid` authenticated. Returns `false` if it already was.
    pub fn add_cid(&self, cid: Cid) -> bool {
        self.cids.lock().insert(cid)
    }

    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.peer_certificate.read().clone()
    }

    pub fn set_peer_certificate(&self, der: Option<Vec<u8>>) {
        *self.peer_certificate.write() = der;
    }

    pub fn write_raw(&self, xml: impl Into<String>) {
        self.command(ConnCommand::Write(xml.into()));
    }

    pub fn send_packet(&self, packet: &Packet) {
        self.write_raw(packet.to_xml());
    }

    pub fn xmpp_stream_open(&self, header: impl Into<String>) {
        self.command(ConnCommand::StreamOpen(header.into()));
    }

    pub fn start_tls(&self, client_mode: bool, want_client_auth: bool, need_client_auth: bool) {
        self.command(ConnCommand::StartTls {
            client_mode,
            want_client_auth,
            need_client_auth,
        });
    }

    /// Queue a packet until [`Connection::process_waiting_packets`].
    pub fn add_packet_to_send(&self, packet: Packet) {
        self.waiting.lock().push_back(packet);
    }

    /// Write every queued packet. Returns how many were written.
    pub fn process_waiting_packets(&self) -> usize {
        let drained: Vec<Packet> = self.waiting.lock().drain(..).collect();
        for packet in &drained {
            self.send_packet(packet);
        }
        drained.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(ConnCommand::Stop);
        }
    }

    pub fn force_stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.tx.send(ConnCommand::ForceStop);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn command(&self, cmd: ConnCommand) {
        if self.is_stopped() {
            tracing::debug!(conn = self.id, ?cmd, "Dropping command for stopped connection");
            return;
        }
        let _ = self.tx.send(cmd);
    }
}
