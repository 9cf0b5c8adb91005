use std::sync::Arc;

use super::{S2sProcessor, StageOrder};
use crate::connection::Connection;
use crate::error::S2sError;
use crate::packet::Packet;
use crate::xml::ns;

/// Closes the connection when the peer reports a stream error.
pub struct StreamError;

impl S2sProcessor for StreamError {
    fn order(&self) -> StageOrder {
        StageOrder::StreamError
    }

    fn name(&self) -> &'static str {
        "stream-error"
    }

    fn process(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        _results: &mut Vec<Packet>,
    ) -> Result<bool, S2sError> {
        if !packet.is("error", ns::STREAMS) {
            return Ok(false);
        }
        let condition = packet
            .element()
            .children()
            .iter()
            .find(|c| c.ns() == Some(ns::STREAM_ERRORS) && c.local_name() != "text")
            .map(|c| c.local_name().to_string());
        tracing::warn!(
            session_id = ?conn.session_id(),
            cid = ?conn.cid(),
            condition = condition.as_deref().unwrap_or("undefined"),
            "Peer sent stream error"
        );
        conn.stop();
        Ok(true)
    }
}
