//! Per-CID aggregate of the connections serving one federation relationship.
//!
//! Every connection for a domain pair registers here, whatever worker is
//! driving it. Membership changes and authentication transitions happen
//! under short `parking_lot` locks; the authenticated flag itself lives on
//! the connection and flips exactly once per CID (see
//! [`Connection::add_cid`]), so concurrent success signals are counted once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::cid::Cid;
use crate::connection::Connection;
use crate::packet::Packet;

/// Default upper bound on outgoing connections per CID.
pub const DEFAULT_MAX_OUT_CONNS: usize = 4;

#[derive(Debug)]
pub struct CidConnections {
    cid: Cid,
    max_out_conns: usize,
    incoming: Mutex<HashMap<u64, Arc<Connection>>>,
    /// Authenticated outgoing connections.
    outgoing: Mutex<HashMap<u64, Arc<Connection>>>,
    /// Outgoing connections still negotiating, side connections included.
    handshaking: Mutex<HashMap<u64, Arc<Connection>>>,
    negotiated: Mutex<HashSet<u64>>,
    waiting_packets: Mutex<VecDeque<Packet>>,
    verify_requests: Mutex<VecDeque<Packet>>,
    connecting: AtomicUsize,
}

impl CidConnections {
    pub fn new(cid: Cid, max_out_conns: usize) -> Self {
        Self {
            cid,
            max_out_conns: max_out_conns.max(1),
            incoming: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(HashMap::new()),
            handshaking: Mutex::new(HashMap::new()),
            negotiated: Mutex::new(HashSet::new()),
            waiting_packets: Mutex::new(VecDeque::new()),
            verify_requests: Mutex::new(VecDeque::new()),
            connecting: AtomicUsize::new(0),
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn add_incoming(&self, conn: &Arc<Connection>) {
        self.incoming.lock().insert(conn.id(), conn.clone());
    }

    /// Register an outgoing connection whose stream is about to open.
    pub fn add_outgoing_handshaking(&self, conn: &Arc<Connection>) {
        self.handshaking.lock().insert(conn.id(), conn.clone());
    }

    /// Mark `cid` authenticated on `conn`.
    ///
    /// Returns `false` and changes nothing when it already was.
    pub fn connection_authenticated(&self, conn: &Arc<Connection>, cid: &Cid) -> bool {
        if !conn.add_cid(cid.clone()) {
            tracing::debug!(cid = %cid, session_id = ?conn.session_id(), "CID already authenticated");
            return false;
        }
        if conn.is_connect() {
            self.handshaking.lock().remove(&conn.id());
            self.outgoing.lock().insert(conn.id(), conn.clone());
        } else {
            self.incoming.lock().insert(conn.id(), conn.clone());
        }
        tracing::info!(
            cid = %cid,
            session_id = ?conn.session_id(),
            direction = ?conn.connection_type(),
            "Connection authenticated"
        );
        true
    }

    pub fn connection_stopped(&self, conn: &Connection) {
        let id = conn.id();
        self.incoming.lock().remove(&id);
        self.outgoing.lock().remove(&id);
        self.handshaking.lock().remove(&id);
        self.negotiated.lock().remove(&id);
        tracing::debug!(cid = %self.cid, conn = id, "Connection removed");
    }

    /// Record that stream negotiation finished on `conn`.
    ///
    /// Only the first call per connection has an effect: it sets the
    /// connection's flag and, for outgoing connections, flushes packets
    /// queued for this CID. Returns whether this call was the first.
    pub fn stream_negotiation_completed(&self, conn: &Arc<Connection>) -> bool {
        conn.context().negotiation_completed = true;
        if !self.negotiated.lock().insert(conn.id()) {
            return false;
        }
        tracing::info!(cid = %self.cid, session_id = ?conn.session_id(), "Stream negotiation completed");
        if conn.is_connect() {
            self.flush_waiting();
        }
        true
    }

    pub fn is_negotiated(&self, conn: &Connection) -> bool {
        self.negotiated.lock().contains(&conn.id())
    }

    fn ready_outgoing(&self) -> Option<Arc<Connection>> {
        let negotiated = self.negotiated.lock();
        self.outgoing
            .lock()
            .values()
            .find(|c| !c.is_stopped() && negotiated.contains(&c.id()))
            .cloned()
    }

    /// Write queued packets on a negotiated outgoing connection, if any.
    pub fn flush_waiting(&self) -> usize {
        let Some(conn) = self.ready_outgoing() else {
            return 0;
        };
        // Write under the queue lock so concurrent flushes keep FIFO order.
        let mut queue = self.waiting_packets.lock();
        let count = queue.len();
        for packet in queue.drain(..) {
            conn.send_packet(&packet);
        }
        drop(queue);
        if count > 0 {
            tracing::debug!(cid = %self.cid, count, "Flushed waiting packets");
        }
        count
    }

    /// Queue `packet` for the remote domain and send it if a negotiated
    /// outgoing connection exists.
    ///
    /// Returns `true` when the caller should open a new outgoing
    /// connection; the slot is reserved until
    /// [`CidConnections::connect_attempt_finished`].
    pub fn send_packet(&self, packet: Packet) -> bool {
        self.waiting_packets.lock().push_back(packet);
        if self.flush_waiting() > 0 {
            return false;
        }
        self.reserve_connect_slot()
    }

    fn reserve_connect_slot(&self) -> bool {
        let main_handshaking = self
            .handshaking
            .lock()
            .values()
            .filter(|c| !c.context().handshaking_only)
            .count();
        if main_handshaking > 0 || !self.outgoing.lock().is_empty() {
            return false;
        }
        let total = self.outgoing_count() + self.handshaking_count();
        self.connecting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n == 0 && total + n < self.max_out_conns).then_some(n + 1)
            })
            .is_ok()
    }

    /// Release a slot reserved by [`CidConnections::send_packet`].
    pub fn connect_attempt_finished(&self) {
        let _ = self
            .connecting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Queue a `<db:verify>` for the next handshaking-only connection.
    pub fn queue_verify_request(&self, packet: Packet) {
        self.verify_requests.lock().push_back(packet);
    }

    pub fn take_verify_requests(&self) -> Vec<Packet> {
        self.verify_requests.lock().drain(..).collect()
    }

    /// Drop everything still queued; used when no connection can be made.
    pub fn take_waiting(&self) -> Vec<Packet> {
        self.waiting_packets.lock().drain(..).collect()
    }

    pub fn connection_for_session(&self, session_id: &str) -> Option<Arc<Connection>> {
        let matches = |c: &&Arc<Connection>| c.session_id().as_deref() == Some(session_id);
        if let Some(c) = self.incoming.lock().values().find(matches) {
            return Some(c.clone());
        }
        if let Some(c) = self.outgoing.lock().values().find(matches) {
            return Some(c.clone());
        }
        self.handshaking.lock().values().find(matches).cloned()
    }

    /// Nothing registered, queued or being connected.
    pub fn is_idle(&self) -> bool {
        self.incoming_count() + self.outgoing_count() + self.handshaking_count() + self.waiting_count() == 0
            && self.verify_requests.lock().is_empty()
            && self.connecting.load(Ordering::Acquire) == 0
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.lock().len()
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing.lock().len()
    }

    pub fn handshaking_count(&self) -> usize {
        self.handshaking.lock().len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting_packets.lock().len()
    }

    pub fn max_out_conns(&self) -> usize {
        self.max_out_conns
    }
}
