//! Direct-viewer connection registry (spec.md §3 "Direct-viewer connection").
//!
//! A connection is keyed by address (a socket path) and refcounted by the
//! set of instances currently referencing it, not by a raw integer — this
//! makes "drop iff every referrer is gone" (spec.md §8 invariant 4)
//! structural rather than something a caller can get wrong.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::engine::worklist::InstanceKey;
use crate::transport::Connection;

struct DirectEntry {
    connection: Option<Arc<Connection>>,
    referrers: HashSet<InstanceKey>,
}

/// Process-wide map of direct-addr viewer connections. A connection may be
/// "only referenced" (an instance named this address in its `new` payload
/// but the slave hasn't dialed it yet, or the dial failed) — `connection`
/// is `None` in that case and sends fall back to the master path.
pub struct DirectRegistry {
    entries: Mutex<HashMap<String, DirectEntry>>,
}

impl DirectRegistry {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Registers `referrer` against `addr`, creating the entry if this is
    /// the first reference.
    pub async fn acquire(&self, addr: &str, referrer: InstanceKey) {
        let mut entries = self.entries.lock().await;
        entries
            .entry(addr.to_string())
            .or_insert_with(|| DirectEntry { connection: None, referrers: HashSet::new() })
            .referrers
            .insert(referrer);
    }

    /// Attaches (or replaces) the live connection for an already-acquired
    /// address.
    pub async fn attach_connection(&self, addr: &str, connection: Arc<Connection>) {
        if let Some(entry) = self.entries.lock().await.get_mut(addr) {
            entry.connection = Some(connection);
        }
    }

    pub async fn connection_for(&self, addr: &str) -> Option<Arc<Connection>> {
        self.entries.lock().await.get(addr).and_then(|e| e.connection.clone())
    }

    /// Drops `referrer`'s reference; the entry (and any attached
    /// connection) is removed once no referrer remains.
    pub async fn unref(&self, addr: &str, referrer: &InstanceKey) {
        let mut entries = self.entries.lock().await;
        let mut now_empty = false;
        if let Some(entry) = entries.get_mut(addr) {
            entry.referrers.remove(referrer);
            now_empty = entry.referrers.is_empty();
        }
        if now_empty {
            entries.remove(addr);
        }
    }

    pub async fn refcount(&self, addr: &str) -> usize {
        self.entries.lock().await.get(addr).map(|e| e.referrers.len()).unwrap_or(0)
    }

    pub async fn is_registered(&self, addr: &str) -> bool {
        self.entries.lock().await.contains_key(addr)
    }
}

impl Default for DirectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: &str) -> InstanceKey {
        ("pkg".to_string(), n.to_string())
    }

    #[tokio::test]
    async fn dropped_only_once_every_referrer_is_gone() {
        let registry = DirectRegistry::new();
        registry.acquire("/tmp/v.sock", key("a")).await;
        registry.acquire("/tmp/v.sock", key("b")).await;
        assert_eq!(registry.refcount("/tmp/v.sock").await, 2);

        registry.unref("/tmp/v.sock", &key("a")).await;
        assert!(registry.is_registered("/tmp/v.sock").await);

        registry.unref("/tmp/v.sock", &key("b")).await;
        assert!(!registry.is_registered("/tmp/v.sock").await);
    }

    #[tokio::test]
    async fn connection_lookup_is_none_until_attached() {
        let registry = DirectRegistry::new();
        registry.acquire("/tmp/v.sock", key("a")).await;
        assert!(registry.connection_for("/tmp/v.sock").await.is_none());
    }
}
