//! Authorization of stanzas that reached the end of the pipeline.

use std::collections::HashSet;
use std::sync::Arc;

use super::{generate_stream_error, FilterVerdict, PacketFilter};
use crate::cid::Cid;
use crate::config::{DomainGroups, S2sConfig};
use crate::connection::Connection;
use crate::dns::IpLookup;
use crate::error::StreamErrorCondition;
use crate::packet::Packet;

pub struct PacketChecker {
    groups: DomainGroups,
    same_ip: bool,
    same_ip_whitelist: HashSet<String>,
    ips: Arc<dyn IpLookup>,
}

impl PacketChecker {
    pub fn new(config: &S2sConfig, ips: Arc<dyn IpLookup>) -> Self {
        Self {
            groups: config.cross_domain_groups.clone(),
            same_ip: config.same_ip_cross_domain,
            same_ip_whitelist: config.same_ip_whitelist.clone(),
            ips,
        }
    }

    /// Remote domains `conn` is authenticated for towards `local`.
    fn authenticated_remotes(conn: &Connection, local: &str) -> Vec<String> {
        conn.cids()
            .into_iter()
            .filter(|c| c.local_host() == local)
            .map(|c| c.remote_host().to_string())
            .collect()
    }

    fn check_routable(&self, packet: &Packet, conn: &Arc<Connection>) -> FilterVerdict {
        let (Some(to), Some(from)) = (packet.to_domain(), packet.from_domain()) else {
            tracing::info!(
                session_id = ?conn.session_id(),
                from = ?packet.stanza_from(),
                to = ?packet.stanza_to(),
                "Stanza without addressing"
            );
            generate_stream_error(conn, StreamErrorCondition::ImproperAddressing, false);
            return FilterVerdict::Drop;
        };
        let (to, from) = (to.to_lowercase(), from.to_lowercase());
        if conn.is_authenticated_cid(&Cid::new(&to, &from)) {
            return FilterVerdict::Pass;
        }

        let remotes = Self::authenticated_remotes(conn, &to);
        if !remotes.is_empty() {
            if remotes.iter().any(|r| self.groups.same_group(r, &from)) {
                tracing::debug!(from = %from, to = %to, "Cross-domain stanza allowed by group");
                return FilterVerdict::Pass;
            }
            if self.same_ip_allowed(&from) {
                match self.peer_ip_matches(conn, &from) {
                    Some(true) => {
                        tracing::debug!(from = %from, to = %to, "Cross-domain stanza allowed by address");
                        return FilterVerdict::Pass;
                    }
                    Some(false) => {}
                    None => return FilterVerdict::Lookup(from),
                }
            }
        }

        tracing::info!(
            session_id = ?conn.session_id(),
            cids = ?conn.cids(),
            from = %from,
            to = %to,
            "Stanza from unauthenticated domain"
        );
        generate_stream_error(conn, StreamErrorCondition::InvalidFrom, false);
        FilterVerdict::Drop
    }

    fn same_ip_allowed(&self, domain: &str) -> bool {
        self.same_ip && (self.same_ip_whitelist.is_empty() || self.same_ip_whitelist.contains(domain))
    }

    /// `None` when `domain` has not been resolved yet.
    fn peer_ip_matches(&self, conn: &Connection, domain: &str) -> Option<bool> {
        let Some(peer) = conn.remote_address() else {
            return Some(false);
        };
        let ips = self.ips.cached_ips(domain)?;
        Some(ips.contains(&peer.ip()))
    }
}

impl PacketFilter for PacketChecker {
    fn name(&self) -> &'static str {
        "packet-checker"
    }

    fn filter(
        &self,
        packet: &Packet,
        conn: &Arc<Connection>,
        _results: &mut Vec<Packet>,
    ) -> FilterVerdict {
        if packet.is_routable() {
            return self.check_routable(packet, conn);
        }
        if packet.is_features() && conn.is_authenticated() {
            return FilterVerdict::Drop;
        }
        tracing::info!(
            session_id = ?conn.session_id(),
            element = packet.name(),
            xmlns = ?packet.xmlns(),
            "Unexpected element"
        );
        generate_stream_error(conn, StreamErrorCondition::InvalidNamespace, false);
        FilterVerdict::Drop
    }
}
