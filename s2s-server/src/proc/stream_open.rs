//! Stream opening, the authentication timer and connection teardown.

use std::sync::Arc;

use super::{generate_stream_error, new_stream_id, S2sProcessor, StageOrder};
use crate::cid::Cid;
use crate::connection::Connection;
use crate::error::StreamErrorCondition;
use crate::handler::{S2sHandler, TimerTask};
use crate::xml::framing::stream_open_xml;
use crate::xml::StreamHeader;

pub struct StreamOpen {
    handler: Arc<dyn S2sHandler>,
}

impl StreamOpen {
    pub fn new(handler: Arc<dyn S2sHandler>) -> Self {
        Self { handler }
    }

    /// Header an outgoing connection opens (and reopens) its stream with.
    pub fn initial_header(cid: &Cid) -> String {
        stream_open_xml(Some(cid.local_host()), Some(cid.remote_host()), None, Some("1.0"))
    }

    fn arm_auth_timer(&self, conn: &Arc<Connection>) {
        let weak = Arc::downgrade(conn);
        let task: TimerTask = Box::new(move || {
            let Some(conn) = weak.upgrade() else {
                return;
            };
            if !conn.is_authenticated() && !conn.is_stopped() {
                tracing::info!(
                    session_id = ?conn.session_id(),
                    cid = ?conn.cid(),
                    "Authentication timed out, closing"
                );
                conn.force_stop();
            }
        });
        let handle = self.handler.add_timer_task(task, self.handler.auth_timeout());
        conn.context().auth_timer = Some(handle);
    }

    fn connect_stream_opened(&self, conn: &Arc<Connection>, header: &StreamHeader) {
        let Some(id) = header.id() else {
            generate_stream_error(conn, StreamErrorCondition::InvalidId, false);
            return;
        };
        conn.set_session_id(id);
        let cid = match conn.cid() {
            Some(cid) => cid,
            None => match (header.to(), header.from()) {
                (Some(to), Some(from)) => {
                    let cid = Cid::new(to, from);
                    conn.context().cid = Some(cid.clone());
                    cid
                }
                _ => return,
            },
        };
        if let Err(e) = self.handler.get_cid_connections(&cid, true) {
            generate_stream_error(conn, e.stream_condition(), false);
        }
    }

    fn accept_stream_opened(&self, conn: &Arc<Connection>, header: &StreamHeader) -> Option<String> {
        let session_id = new_stream_id();
        conn.set_session_id(session_id.clone());
        if let Some(to) = header.to() {
            conn.context().hostname = Some(to.to_lowercase());
        }

        let Some(to) = header.to().filter(|d| self.handler.is_local_domain(&d.to_lowercase())) else {
            tracing::info!(to = ?header.to(), from = ?header.from(), "Stream addressed to unknown host");
            generate_stream_error(conn, StreamErrorCondition::HostUnknown, true);
            return None;
        };

        let cid = match header.from() {
            Some(from) => {
                let cid = Cid::new(to, from);
                conn.context().cid = Some(cid.clone());
                Some(cid)
            }
            None => conn.cid(),
        };
        if let Some(cid) = &cid {
            match self.handler.get_cid_connections(cid, true) {
                Ok(Some(cc)) => cc.add_incoming(conn),
                Ok(None) => {}
                Err(e) => {
                    tracing::info!(cid = %cid, error = %e, "Rejecting stream");
                    generate_stream_error(conn, e.stream_condition(), true);
                    return None;
                }
            }
        }

        tracing::debug!(session_id = %session_id, cid = ?cid, version = ?header.version(), "Stream opened");
        Some(stream_open_xml(
            Some(&to.to_lowercase()),
            header.from(),
            Some(&session_id),
            header.version().map(|_| "1.0"),
        ))
    }
}

impl S2sProcessor for StreamOpen {
    fn order(&self) -> StageOrder {
        StageOrder::StreamOpen
    }

    fn name(&self) -> &'static str {
        "stream-open"
    }

    fn service_started(&self, conn: &Arc<Connection>) {
        self.arm_auth_timer(conn);
        if conn.is_connect() {
            if let Some(cid) = conn.cid() {
                conn.xmpp_stream_open(Self::initial_header(&cid));
            }
        }
    }

    fn stream_opened(&self, conn: &Arc<Connection>, header: &StreamHeader) -> Option<String> {
        conn.context().version = header.version().map(str::to_string);
        if conn.is_connect() {
            self.connect_stream_opened(conn, header);
            None
        } else {
            self.accept_stream_opened(conn, header)
        }
    }

    fn service_stopped(&self, conn: &Arc<Connection>) {
        let (timer, bound) = {
            let mut ctx = conn.context();
            (ctx.auth_timer.take(), ctx.cid.clone())
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        let mut cids = conn.cids();
        cids.extend(bound);
        cids.sort();
        cids.dedup();
        for cid in &cids {
            if let Ok(Some(cc)) = self.handler.get_cid_connections(cid, false) {
                cc.connection_stopped(conn);
            }
        }
        tracing::debug!(session_id = ?conn.session_id(), cids = cids.len(), "Connection stopped");
    }
}
