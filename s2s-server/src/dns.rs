//! Server resolution for outgoing connections and the cached domain→IP
//! table used by the same-IP cross-domain check.
//!
//! Outgoing targets come from `_xmpp-server._tcp.<domain>` SRV records,
//! sorted by priority ascending then weight descending, with
//! `<domain>:5269` as the fallback. Static routes bypass DNS entirely.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::RwLock;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

pub const DEFAULT_S2S_PORT: u16 = 5269;

/// Synchronous view of already-resolved addresses.
pub trait IpLookup: Send + Sync {
    /// `None` when `domain` has not been resolved yet.
    fn cached_ips(&self, domain: &str) -> Option<Vec<IpAddr>>;
}

/// One candidate address for an outgoing connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// SRV target as returned by DNS.
#[derive(Debug, Clone)]
pub struct SrvTarget {
    pub priority: u16,
    pub weight: u16,
    pub target: String,
    pub port: u16,
}

/// Connection order for SRV targets. A `.` target means the service is
/// explicitly unavailable and is dropped.
pub fn order_srv(mut records: Vec<SrvTarget>) -> Vec<Endpoint> {
    records.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    records
        .into_iter()
        .filter_map(|r| {
            let host = r.target.trim_end_matches('.').to_string();
            (!host.is_empty()).then_some(Endpoint { host, port: r.port })
        })
        .collect()
}

fn parse_route(addr: &str) -> Option<Endpoint> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some(Endpoint {
        host: host.to_string(),
        port,
    })
}

pub struct DomainResolver {
    resolver: TokioAsyncResolver,
    static_routes: HashMap<String, Endpoint>,
    cache: RwLock<HashMap<String, Vec<IpAddr>>>,
}

impl DomainResolver {
    /// Resolver from the system configuration, or the default upstreams
    /// when that cannot be read. Unparseable static routes are skipped.
    pub fn new(static_routes: HashMap<String, String>) -> Self {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load system DNS config, using defaults");
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };
        let static_routes = static_routes
            .into_iter()
            .filter_map(|(domain, addr)| match parse_route(&addr) {
                Some(ep) => Some((domain.to_lowercase(), ep)),
                None => {
                    tracing::warn!(domain = %domain, addr = %addr, "Ignoring malformed static route");
                    None
                }
            })
            .collect();
        Self {
            resolver,
            static_routes,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn static_route(&self, domain: &str) -> Option<&Endpoint> {
        self.static_routes.get(&domain.to_lowercase())
    }

    /// Candidate endpoints for `domain`, in connection-attempt order.
    pub async fn resolve_endpoints(&self, domain: &str) -> Vec<Endpoint> {
        if let Some(ep) = self.static_route(domain) {
            return vec![ep.clone()];
        }
        let srv_name = format!("_xmpp-server._tcp.{domain}.");
        let endpoints = match self.resolver.srv_lookup(srv_name.as_str()).await {
            Ok(lookup) => order_srv(
                lookup
                    .iter()
                    .map(|r| SrvTarget {
                        priority: r.priority(),
                        weight: r.weight(),
                        target: r.target().to_utf8(),
                        port: r.port(),
                    })
                    .collect(),
            ),
            Err(e) => {
                tracing::debug!(domain, error = %e, "SRV lookup failed");
                Vec::new()
            }
        };
        if endpoints.is_empty() {
            return vec![Endpoint {
                host: domain.to_string(),
                port: DEFAULT_S2S_PORT,
            }];
        }
        tracing::debug!(domain, endpoints = ?endpoints, "SRV resolved");
        endpoints
    }

    /// Addresses every endpoint of `domain` resolves to. The result is
    /// cached for [`IpLookup::cached_ips`], empty lists included.
    pub async fn resolve_ips(&self, domain: &str) -> Vec<IpAddr> {
        let mut ips = Vec::new();
        for ep in self.resolve_endpoints(domain).await {
            if let Ok(ip) = ep.host.parse::<IpAddr>() {
                ips.push(ip);
                continue;
            }
            match self.resolver.lookup_ip(ep.host.as_str()).await {
                Ok(lookup) => ips.extend(lookup.iter()),
                Err(e) => tracing::debug!(host = %ep.host, error = %e, "Address lookup failed"),
            }
        }
        ips.sort();
        ips.dedup();
        self.remember(domain, ips.clone());
        ips
    }

    pub fn remember(&self, domain: &str, ips: Vec<IpAddr>) {
        self.cache.write().insert(domain.to_lowercase(), ips);
    }

    pub fn cached_domains(&self) -> usize {
        self.cache.read().len()
    }
}

impl IpLookup for DomainResolver {
    fn cached_ips(&self, domain: &str) -> Option<Vec<IpAddr>> {
        self.cache.read().get(&domain.to_lowercase()).cloned()
    }
}
