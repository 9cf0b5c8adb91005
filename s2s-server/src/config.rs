//! Server configuration: CLI flags and environment, with an optional TOML
//! file layered on top.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use serde::Deserialize;

use crate::cid_connections::DEFAULT_MAX_OUT_CONNS;

#[derive(Parser, Debug, Clone)]
#[command(name = "s2s-server", about = "XMPP server-to-server federation engine")]
pub struct ServerConfig {
    /// Address to listen on for incoming S2S connections.
    #[arg(long, default_value = "0.0.0.0:5269", env = "S2S_LISTEN_ADDR")]
    pub listen_addr: String,

    /// Domains served by this server.
    #[arg(long = "domain", env = "S2S_DOMAINS", value_delimiter = ',')]
    pub domains: Vec<String>,

    /// PEM certificate chain. TLS is disabled without it.
    #[arg(long, env = "S2S_TLS_CERT")]
    pub tls_cert: Option<String>,

    #[arg(long, env = "S2S_TLS_KEY")]
    pub tls_key: Option<String>,

    /// Extra PEM trust anchors, added to the webpki roots.
    #[arg(long, env = "S2S_TLS_CA")]
    pub tls_ca: Option<String>,

    #[arg(long, env = "S2S_TLS_REQUIRED")]
    pub tls_required: bool,

    /// Remote hosts exempt from TLS policy.
    #[arg(long, env = "S2S_SKIP_TLS_HOSTS", value_delimiter = ',')]
    pub skip_tls_hosts: Vec<String>,

    #[arg(long, default_value_t = 30, env = "S2S_AUTH_TIMEOUT_SECS")]
    pub auth_timeout_secs: u64,

    /// Domain groups allowed to send over each other's connections,
    /// e.g. `a.example:b.example,c.example:d.example`.
    #[arg(long, env = "S2S_CROSS_DOMAIN_GROUPS")]
    pub cross_domain_groups: Option<String>,

    /// Allow cross-domain stanzas from domains resolving to the peer's IP.
    #[arg(long, env = "S2S_SAME_IP_CROSS_DOMAIN")]
    pub same_ip_cross_domain: bool,

    #[arg(long, env = "S2S_SAME_IP_WHITELIST", value_delimiter = ',')]
    pub same_ip_whitelist: Vec<String>,

    /// Run dialback with trusted peers that do not advertise it.
    #[arg(long, env = "S2S_DIALBACK_WORKAROUND")]
    pub dialback_workaround: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "S2S_SASL_LEGACY_COMPAT")]
    pub sasl_legacy_compat: bool,

    #[arg(long, env = "S2S_SASL_SKIP_DOMAINS", value_delimiter = ',')]
    pub sasl_skip_domains: Vec<String>,

    #[arg(long, default_value_t = DEFAULT_MAX_OUT_CONNS, env = "S2S_MAX_OUT_CONNS")]
    pub max_out_conns: usize,

    /// `domain=host:port` routes that bypass DNS.
    #[arg(long = "static-route", env = "S2S_STATIC_ROUTES", value_delimiter = ',')]
    pub static_routes: Vec<String>,

    /// Interval for the statistics log line and pending-verify sweep.
    #[arg(long, default_value_t = 60, env = "S2S_STATS_INTERVAL_SECS")]
    pub stats_interval_secs: u64,

    /// TOML file overriding any of the settings above.
    #[arg(long, env = "S2S_CONFIG")]
    pub config: Option<String>,

    /// Per-domain dialback secrets (TOML only). Missing domains get a
    /// random secret at startup.
    #[arg(skip)]
    pub dialback_secrets: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5269".to_string(),
            domains: Vec::new(),
            tls_cert: None,
            tls_key: None,
            tls_ca: None,
            tls_required: false,
            skip_tls_hosts: Vec::new(),
            auth_timeout_secs: 30,
            cross_domain_groups: None,
            same_ip_cross_domain: false,
            same_ip_whitelist: Vec::new(),
            dialback_workaround: false,
            sasl_legacy_compat: true,
            sasl_skip_domains: Vec::new(),
            max_out_conns: DEFAULT_MAX_OUT_CONNS,
            static_routes: Vec::new(),
            stats_interval_secs: 60,
            config: None,
            dialback_secrets: HashMap::new(),
        }
    }
}

/// Settings accepted in the `--config` file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen_addr: Option<String>,
    pub domains: Option<Vec<String>>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub tls_ca: Option<String>,
    pub tls_required: Option<bool>,
    pub skip_tls_hosts: Option<Vec<String>>,
    pub auth_timeout_secs: Option<u64>,
    pub cross_domain_groups: Option<String>,
    pub same_ip_cross_domain: Option<bool>,
    pub same_ip_whitelist: Option<Vec<String>>,
    pub dialback_workaround: Option<bool>,
    pub sasl_legacy_compat: Option<bool>,
    pub sasl_skip_domains: Option<Vec<String>>,
    pub max_out_conns: Option<usize>,
    pub static_routes: Option<HashMap<String, String>>,
    pub stats_interval_secs: Option<u64>,
    #[serde(default)]
    pub dialback_secrets: HashMap<String, String>,
}

macro_rules! overlay {
    ($target:expr, $file:expr, $($field:ident),+ $(,)?) => {
        $(if let Some(v) = $file.$field { $target.$field = v; })+
    };
}

impl ServerConfig {
    /// Parse CLI/env and apply the `--config` file when given.
    pub fn load() -> Result<Self> {
        Self::parse().with_file_overlay()
    }

    pub fn with_file_overlay(mut self) -> Result<Self> {
        let Some(path) = self.config.clone() else {
            return Ok(self);
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let file: FileConfig =
            toml::from_str(&raw).with_context(|| format!("Invalid config file: {path}"))?;
        self.apply(file);
        Ok(self)
    }

    pub fn apply(&mut self, file: FileConfig) {
        overlay!(
            self,
            file,
            listen_addr,
            domains,
            tls_required,
            skip_tls_hosts,
            auth_timeout_secs,
            same_ip_cross_domain,
            same_ip_whitelist,
            dialback_workaround,
            sasl_legacy_compat,
            sasl_skip_domains,
            max_out_conns,
            stats_interval_secs,
        );
        if file.tls_cert.is_some() {
            self.tls_cert = file.tls_cert;
        }
        if file.tls_key.is_some() {
            self.tls_key = file.tls_key;
        }
        if file.tls_ca.is_some() {
            self.tls_ca = file.tls_ca;
        }
        if file.cross_domain_groups.is_some() {
            self.cross_domain_groups = file.cross_domain_groups;
        }
        if let Some(routes) = file.static_routes {
            self.static_routes = routes
                .into_iter()
                .map(|(domain, addr)| format!("{domain}={addr}"))
                .collect();
        }
        self.dialback_secrets.extend(file.dialback_secrets);
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Parsed `domain=host:port` overrides.
    pub fn static_route_map(&self) -> Result<HashMap<String, String>> {
        self.static_routes
            .iter()
            .map(|route| {
                let (domain, addr) = route
                    .split_once('=')
                    .with_context(|| format!("Static route must be domain=host:port: {route}"))?;
                let domain = domain.trim().to_lowercase();
                let addr = addr.trim();
                anyhow::ensure!(
                    !domain.is_empty() && addr.contains(':'),
                    "Static route must be domain=host:port: {route}"
                );
                Ok((domain, addr.to_string()))
            })
            .collect()
    }

    /// Runtime policy consumed by the protocol stages.
    pub fn policy(&self) -> S2sConfig {
        let lower = |v: &[String]| -> HashSet<String> {
            v.iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        S2sConfig {
            local_domains: lower(&self.domains),
            tls_required: self.tls_required,
            skip_tls_hosts: lower(&self.skip_tls_hosts),
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
            cross_domain_groups: self
                .cross_domain_groups
                .as_deref()
                .map(DomainGroups::parse)
                .unwrap_or_default(),
            same_ip_cross_domain: self.same_ip_cross_domain,
            same_ip_whitelist: lower(&self.same_ip_whitelist),
            dialback_workaround: self.dialback_workaround,
            sasl_legacy_compat: self.sasl_legacy_compat,
            sasl_skip_domains: lower(&self.sasl_skip_domains),
            max_out_conns: self.max_out_conns,
        }
    }
}

/// Groups of domains that may send over each other's authenticated
/// connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainGroups {
    groups: Vec<HashSet<String>>,
}

impl DomainGroups {
    /// `a:b,c:d:e` → `{a, b}`, `{c, d, e}`.
    pub fn parse(raw: &str) -> Self {
        let groups = raw
            .split(',')
            .map(|group| {
                group
                    .split(':')
                    .map(|d| d.trim().to_lowercase())
                    .filter(|d| !d.is_empty())
                    .collect::<HashSet<_>>()
            })
            .filter(|g| g.len() > 1)
            .collect();
        Self { groups }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn same_group(&self, a: &str, b: &str) -> bool {
        let (a, b) = (a.to_lowercase(), b.to_lowercase());
        self.groups
            .iter()
            .any(|g| g.contains(&a) && g.contains(&b))
    }
}

/// Immutable policy shared by the pipeline stages.
#[derive(Debug, Clone)]
pub struct S2sConfig {
    pub local_domains: HashSet<String>,
    pub tls_required: bool,
    pub skip_tls_hosts: HashSet<String>,
    pub auth_timeout: Duration,
    pub cross_domain_groups: DomainGroups,
    pub same_ip_cross_domain: bool,
    pub same_ip_whitelist: HashSet<String>,
    pub dialback_workaround: bool,
    pub sasl_legacy_compat: bool,
    pub sasl_skip_domains: HashSet<String>,
    pub max_out_conns: usize,
}

impl Default for S2sConfig {
    fn default() -> Self {
        ServerConfig::default().policy()
    }
}
