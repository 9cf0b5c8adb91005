//! Detects the end of stream negotiation.
//!
//! Negotiation is complete once a features element for an authenticated
//! connection carries nothing marked `<required/>`. Both directions are
//! watched: features received on outgoing connections and features we
//! send on incoming ones.

use std::sync::Arc;

use super::{S2sProcessor, StageOrder};
use crate::connection::Connection;
use crate::error::S2sError;
use crate::handler::S2sHandler;
use crate::packet::Packet;
use crate::xml::Element;

pub struct StreamFeatures {
    handler: Arc<dyn S2sHandler>,
}

/// No advertised feature is mandatory.
pub fn negotiation_done(features: &Element) -> bool {
    features
        .children()
        .iter()
        .all(|c| c.child_named("required").is_none())
}

impl StreamFeatures {
    pub fn new(handler: Arc<dyn S2sHandler>) -> Self {
        Self { handler }
    }

    fn check(&self, features: &Packet, conn: &Arc<Connection>) {
        if !negotiation_done(features.element()) || conn.context().negotiation_completed {
            return;
        }
        for cid in conn.cids() {
            match self.handler.get_cid_connections(&cid, false) {
                Ok(Some(cc)) => {
                    cc.stream_negotiation_completed(conn);
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(cid = %cid, error = %e, "No CID registry for negotiated stream"),
            }
        }
    }
}

impl S2sProcessor for StreamFeatures {
    fn order(&self) -> StageOrder {
        StageOrder::StreamFeatures
    }

    fn name(&self) -> &'static str {
        "stream-features"
    }

    fn process(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        _results: &mut Vec<Packet>,
    ) -> Result<bool, S2sError> {
        if !packet.is_features() || !conn.is_authenticated() {
            return Ok(false);
        }
        self.check(packet, conn);
        Ok(true)
    }

    fn packet_sent(&self, packet: &Packet, conn: &Arc<Connection>) {
        if packet.is_features() && conn.is_authenticated() {
            self.check(packet, conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnCommand;
    use crate::proc::test_support::{cid, drain, features, fixture, stanza};
    use crate::xml::ns;

    #[test]
    fn required_child_blocks_completion() {
        let done = Element::with_ns("dialback", ns::DIALBACK_FEATURES);
        let pending = Element::with_ns("starttls", ns::TLS).with_child(Element::new("required"));
        assert!(negotiation_done(features(vec![done.clone()]).element()));
        assert!(!negotiation_done(features(vec![done, pending]).element()));
    }

    #[test]
    fn features_on_authenticated_outgoing_flush_queue() {
        let f = fixture();
        let (conn, mut rx) = f.connect(cid());
        let cc = f.handler.cid_connections(&cid()).unwrap();
        cc.connection_authenticated(&conn, &cid());
        cc.send_packet(stanza("message", "a@local.test", "b@remote.test"));

        let dispatch = f.pipeline.process_packet(features(vec![]), &conn);
        assert!(dispatch.route.is_none());
        assert!(cc.is_negotiated(&conn));
        let cmds = drain(&mut rx);
        assert!(matches!(&cmds[0], ConnCommand::Write(x) if x.starts_with("<message")));

        // A second features element changes nothing.
        f.pipeline.process_packet(features(vec![]), &conn);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn features_before_authentication_fall_through() {
        let f = fixture();
        let (conn, _rx) = f.connect(cid());
        let mut results = Vec::new();
        let stage = StreamFeatures::new(f.handler.clone());
        assert!(!stage.process(&features(vec![]), &conn, &mut results).unwrap());
        assert!(!conn.context().negotiation_completed);
    }

    #[test]
    fn sent_features_complete_incoming_negotiation() {
        let f = fixture();
        let (conn, _rx) = f.accept();
        let cc = f.handler.get_cid_connections(&cid(), true).unwrap().unwrap();
        cc.add_incoming(&conn);
        cc.connection_authenticated(&conn, &cid());
        let stage = StreamFeatures::new(f.handler.clone());
        stage.packet_sent(&features(vec![]), &conn);
        assert!(cc.is_negotiated(&conn));
    }
}
