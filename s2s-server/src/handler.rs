//! The boundary contract the protocol stages call back into.
//!
//! Stages never own sockets, the CID registry or timers. They reach all of
//! that through [`S2sHandler`], implemented for production by
//! [`crate::manager::S2sState`] and by a recording fake in tests.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::cid::Cid;
use crate::cid_connections::CidConnections;
use crate::connection::Connection;
use crate::error::S2sError;
use crate::xml::Element;

/// Deferred work scheduled with [`S2sHandler::add_timer_task`].
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Cancellation handle for a scheduled [`TimerTask`].
#[derive(Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Which dialback element a [`VerifyResult`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialbackElement {
    Result,
    Verify,
}

impl DialbackElement {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Result => "db:result",
            Self::Verify => "db:verify",
        }
    }
}

/// A dialback element to deliver on a connection other than the one being
/// processed: a verify request over a side connection, or the final
/// result on the original requesting stream.
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub element: DialbackElement,
    /// CID of the connection that produced this result.
    pub cid_main: Cid,
    /// Domain pair the element is about; written as from=local, to=remote.
    pub cid_packet: Cid,
    /// `Some(true)` → `type='valid'`, `Some(false)` → `type='invalid'`,
    /// `None` → a request without a type.
    pub valid: Option<bool>,
    pub id: Option<String>,
    /// Session to deliver on, when not using a side connection.
    pub session_id: Option<String>,
    /// Dialback key carried as character data.
    pub key: Option<String>,
    /// Deliver over a dedicated handshaking-only outgoing connection.
    pub side_connection: bool,
    /// Error payload; turns the element into `type='error'`.
    pub error: Option<Element>,
}

impl VerifyResult {
    /// The element as it goes on the wire.
    pub fn to_element(&self) -> Element {
        let mut el = Element::prefixed(self.element.name(), crate::xml::ns::DIALBACK)
            .with_attr("from", self.cid_packet.local_host())
            .with_attr("to", self.cid_packet.remote_host());
        if let Some(id) = &self.id {
            el.set_attr("id", id.clone());
        }
        match (&self.error, self.valid) {
            (Some(error), _) => {
                el.set_attr("type", "error");
                el.push_child(error.clone());
            }
            (None, Some(true)) => el.set_attr("type", "valid"),
            (None, Some(false)) => el.set_attr("type", "invalid"),
            (None, None) => {}
        }
        if let Some(key) = &self.key {
            el = el.with_text(key.clone());
        }
        el
    }
}

/// Services the protocol stages need from the surrounding server.
pub trait S2sHandler: Send + Sync {
    /// Aggregate for `cid`. Fails when the local side is not served here
    /// or the remote side is one of our own domains.
    fn get_cid_connections(
        &self,
        cid: &Cid,
        create: bool,
    ) -> Result<Option<Arc<CidConnections>>, S2sError>;

    fn secret_for_domain(&self, domain: &str) -> Result<String, S2sError>;

    /// Whether policy mandates TLS for streams serving `domain`.
    fn is_tls_required(&self, domain: &str) -> bool;

    /// Remote hosts exempt from TLS policy.
    fn skip_tls_for_host(&self, host: &str) -> bool;

    /// Whether a TLS context is configured at all.
    fn tls_available(&self) -> bool;

    fn is_local_domain(&self, domain: &str) -> bool;

    fn write_raw_data(&self, conn: &Connection, xml: &str) {
        conn.write_raw(xml);
    }

    fn add_timer_task(&self, task: TimerTask, delay: Duration) -> TimerHandle;

    /// Authentication timeout for new connections.
    fn auth_timeout(&self) -> Duration;

    /// Deliver a dialback element outside the current connection.
    /// Returns `false` when no route exists for it.
    fn send_verify_result(&self, result: VerifyResult) -> bool;

    fn connection_for_session(&self, session_id: &str) -> Option<Arc<Connection>>;
}
