//! Connection identifiers: the (local domain, remote domain) pair that
//! names one federation relationship.

use std::fmt;
use std::str::FromStr;

/// Ordered (local, remote) domain pair.
///
/// Domains are stored lowercased so that `Example.COM` and `example.com`
/// share one relationship.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid {
    local_host: String,
    remote_host: String,
}

impl Cid {
    pub fn new(local_host: impl AsRef<str>, remote_host: impl AsRef<str>) -> Self {
        Self {
            local_host: local_host.as_ref().trim().to_ascii_lowercase(),
            remote_host: remote_host.as_ref().trim().to_ascii_lowercase(),
        }
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    /// The same relationship seen from the other server.
    pub fn reversed(&self) -> Cid {
        Cid {
            local_host: self.remote_host.clone(),
            remote_host: self.local_host.clone(),
        }
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_host, self.remote_host)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid CID {0:?}, expected local@remote")]
pub struct ParseCidError(String);

impl FromStr for Cid {
    type Err = ParseCidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((local, remote)) if !local.trim().is_empty() && !remote.trim().is_empty() => {
                Ok(Cid::new(local, remote))
            }
            _ => Err(ParseCidError(s.to_string())),
        }
    }
}
