use std::sync::Arc;

use super::{S2sProcessor, StageOrder};
use crate::connection::Connection;
use crate::error::S2sError;
use crate::packet::Packet;
use crate::xml::{ns, Element};

/// Stream compression is never offered; requests for it are refused.
pub struct StartZlib;

impl S2sProcessor for StartZlib {
    fn order(&self) -> StageOrder {
        StageOrder::StartZlib
    }

    fn name(&self) -> &'static str {
        "start-zlib"
    }

    fn process(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        results: &mut Vec<Packet>,
    ) -> Result<bool, S2sError> {
        if !packet.is("compress", ns::COMPRESS) {
            return Ok(false);
        }
        tracing::debug!(session_id = ?conn.session_id(), "Refusing stream compression");
        results.push(Packet::new(
            Element::with_ns("failure", ns::COMPRESS).with_child(Element::new("unsupported-method")),
        ));
        Ok(true)
    }
}
