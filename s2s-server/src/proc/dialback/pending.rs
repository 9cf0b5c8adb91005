//! Correlation of outstanding `<db:verify>` requests.
//!
//! A receiving server that relays a key over a side connection records the
//! request here, keyed by the CID it concerns and the stream id it was
//! issued for. The typed answer is honored only if it takes a matching
//! entry out of the table.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cid::Cid;

#[derive(Debug, Clone)]
pub struct PendingVerify {
    /// Session of the stream that sent the untyped `<db:result>`.
    pub origin_session: String,
    pub requested_at: Instant,
}

#[derive(Debug, Default)]
pub struct PendingVerifications {
    entries: Mutex<HashMap<(Cid, String), PendingVerify>>,
}

impl PendingVerifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, cid: Cid, stream_id: impl Into<String>, origin_session: impl Into<String>) {
        self.entries.lock().insert(
            (cid, stream_id.into()),
            PendingVerify {
                origin_session: origin_session.into(),
                requested_at: Instant::now(),
            },
        );
    }

    /// Remove and return the entry a typed answer refers to.
    pub fn take(&self, cid: &Cid, stream_id: &str) -> Option<PendingVerify> {
        self.entries.lock().remove(&(cid.clone(), stream_id.to_string()))
    }

    pub fn has_pending_for(&self, cid: &Cid) -> bool {
        self.entries.lock().keys().any(|(c, _)| c == cid)
    }

    /// Drop entries older than `max_age` as of `now`, returning their keys.
    pub fn expire_at(&self, now: Instant, max_age: Duration) -> Vec<(Cid, String)> {
        let mut entries = self.entries.lock();
        let expired: Vec<(Cid, String)> = entries
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.requested_at) > max_age)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
