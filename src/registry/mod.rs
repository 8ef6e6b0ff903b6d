//! Tunnel registry — the authoritative mapping from subdomain, tunnel id,
//! and control channel to live tunnel state.
//!
//! ## Design
//!
//! - **Three agreeing indices** behind one lock: `by_subdomain`, `by_id`,
//!   and `by_channel` (keyed by the channel's identifier, never the channel
//!   object, so closing a channel releases every reference to it).
//! - **Atomic operations**: each registry call either fully applies or
//!   leaves all three indices untouched.
//! - **Prompt access**: the lock is a plain `std::sync::Mutex` held only for
//!   map manipulation — nothing awaits while holding it.
//! - **Events**: `tunnel.created` / `tunnel.closed` are published on the
//!   process-wide broadcast bus for dashboard consumption.

pub mod pending;
pub mod tunnel;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::channel::ChannelHandle;
use crate::error::{ErrorCode, GatewayError};
use crate::ids;

pub use tunnel::Tunnel;

#[derive(Default)]
struct Indices {
    by_subdomain: HashMap<String, Arc<Tunnel>>,
    by_id: HashMap<String, Arc<Tunnel>>,
    by_channel: HashMap<String, Vec<String>>,
}

/// Registry of live tunnels. Shared behind an `Arc`.
pub struct TunnelRegistry {
    inner: Mutex<Indices>,
    events: broadcast::Sender<Value>,
    max_per_channel: usize,
}

impl TunnelRegistry {
    pub fn new(max_per_channel: usize, events: broadcast::Sender<Value>) -> Self {
        Self {
            inner: Mutex::new(Indices::default()),
            events,
            max_per_channel,
        }
    }

    /// Register a tunnel for `channel`.
    ///
    /// With a requested subdomain: rejects `INVALID_SUBDOMAIN` on grammar
    /// failure and `SUBDOMAIN_TAKEN` when reserved or live. Without one:
    /// generates until a free label is found. `TUNNEL_LIMIT_EXCEEDED` when
    /// the channel already owns the cap. On any rejection no state changes.
    pub fn register(
        &self,
        channel: &ChannelHandle,
        requested: Option<&str>,
        local_port: u16,
        auth_token: Option<String>,
    ) -> Result<Arc<Tunnel>, GatewayError> {
        let mut inner = self.lock();

        let owned = inner.by_channel.get(&channel.id).map_or(0, |t| t.len());
        if owned >= self.max_per_channel {
            return Err(GatewayError::new(
                ErrorCode::TunnelLimitExceeded,
                format!(
                    "Channel already owns {owned} tunnels (limit {})",
                    self.max_per_channel
                ),
            ));
        }

        let subdomain = match requested {
            Some(label) => {
                let folded = label.to_ascii_lowercase();
                // Reserved labels answer "taken" regardless of grammar, so a
                // client asking for "api" learns it can never have it.
                if ids::is_reserved(&folded) || inner.by_subdomain.contains_key(&folded) {
                    return Err(GatewayError::new(
                        ErrorCode::SubdomainTaken,
                        format!("Subdomain '{folded}' is not available"),
                    ));
                }
                if !ids::is_valid_subdomain(&folded) {
                    return Err(GatewayError::new(
                        ErrorCode::InvalidSubdomain,
                        format!("Subdomain '{label}' does not match the required grammar"),
                    ));
                }
                folded
            }
            // Generate, test, retry — no ordering on the namespace.
            None => loop {
                let candidate = ids::generate_subdomain();
                if !ids::is_reserved(&candidate) && !inner.by_subdomain.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let tunnel_id = loop {
            let candidate = ids::generate_tunnel_id();
            if !inner.by_id.contains_key(&candidate) {
                break candidate;
            }
        };

        let tunnel = Arc::new(Tunnel::new(
            tunnel_id.clone(),
            subdomain.clone(),
            channel.clone(),
            local_port,
            auth_token,
        ));

        inner
            .by_subdomain
            .insert(subdomain.clone(), Arc::clone(&tunnel));
        inner.by_id.insert(tunnel_id.clone(), Arc::clone(&tunnel));
        inner
            .by_channel
            .entry(channel.id.clone())
            .or_default()
            .push(tunnel_id.clone());
        drop(inner);

        info!(
            tunnel = %tunnel_id,
            subdomain = %subdomain,
            channel = %channel.id,
            local_port,
            "Tunnel registered"
        );
        let _ = self.events.send(json!({
            "type": "tunnel.created",
            "tunnel": tunnel.stats(),
        }));

        Ok(tunnel)
    }

    /// Case-folded subdomain lookup.
    pub fn lookup_by_subdomain(&self, label: &str) -> Option<Arc<Tunnel>> {
        let folded = label.to_ascii_lowercase();
        self.lock().by_subdomain.get(&folded).cloned()
    }

    pub fn lookup_by_id(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.lock().by_id.get(tunnel_id).cloned()
    }

    /// Tunnels currently owned by a channel.
    pub fn list_by_channel(&self, channel_id: &str) -> Vec<Arc<Tunnel>> {
        let inner = self.lock();
        inner
            .by_channel
            .get(channel_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list_all(&self) -> Vec<Arc<Tunnel>> {
        self.lock().by_id.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.lock().by_id.len()
    }

    /// Close a tunnel: unlink all three indices, fail every surviving
    /// pending request, publish `tunnel.closed`. Idempotent — closing an
    /// unknown id is a no-op.
    pub fn close(&self, tunnel_id: &str, reason: &str) -> bool {
        let mut inner = self.lock();
        let Some(tunnel) = inner.by_id.remove(tunnel_id) else {
            return false;
        };
        inner.by_subdomain.remove(&tunnel.subdomain);
        if let Some(owned) = inner.by_channel.get_mut(&tunnel.channel.id) {
            owned.retain(|id| id != tunnel_id);
            if owned.is_empty() {
                inner.by_channel.remove(&tunnel.channel.id);
            }
        }
        drop(inner);

        let failed = tunnel.pending.fail_all(
            ErrorCode::RequestFailed.as_str(),
            &format!("Tunnel closed: {reason}"),
        );
        if failed > 0 {
            debug!(tunnel = %tunnel_id, failed, "Failed pending requests on close");
        }

        info!(tunnel = %tunnel_id, subdomain = %tunnel.subdomain, reason, "Tunnel closed");
        let _ = self.events.send(json!({
            "type": "tunnel.closed",
            "tunnel": tunnel.stats(),
            "reason": reason,
        }));
        true
    }

    /// Close every tunnel a channel owns, leaving the channel with none.
    pub fn close_all_for_channel(&self, channel_id: &str, reason: &str) {
        let snapshot: Vec<String> = self
            .lock()
            .by_channel
            .get(channel_id)
            .cloned()
            .unwrap_or_default();
        for tunnel_id in snapshot {
            self.close(&tunnel_id, reason);
        }
    }

    /// Snapshot-then-close the entire registry.
    pub fn close_all(&self, reason: &str) {
        let snapshot: Vec<String> = self.lock().by_id.keys().cloned().collect();
        for tunnel_id in snapshot {
            self.close(&tunnel_id, reason);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Indices> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHandle;

    fn registry() -> TunnelRegistry {
        let (events, _) = broadcast::channel(16);
        TunnelRegistry::new(10, events)
    }

    fn channel(id: &str) -> ChannelHandle {
        let (handle, _rx) = ChannelHandle::open(id.to_string(), "127.0.0.1:9999".to_string(), 16);
        handle
    }

    #[test]
    fn register_links_all_three_indices() {
        let reg = registry();
        let ch = channel("ch1");
        let t = reg.register(&ch, Some("demo1"), 8080, None).unwrap();

        assert_eq!(t.id.len(), 12);
        assert_eq!(t.subdomain, "demo1");
        let by_sub = reg.lookup_by_subdomain("demo1").unwrap();
        let by_id = reg.lookup_by_id(&t.id).unwrap();
        assert_eq!(by_sub.id, by_id.id);
        assert_eq!(reg.list_by_channel("ch1").len(), 1);
    }

    #[test]
    fn lookup_is_case_folded() {
        let reg = registry();
        reg.register(&channel("ch1"), Some("DeMo1"), 8080, None)
            .unwrap();
        assert!(reg.lookup_by_subdomain("demo1").is_some());
        assert!(reg.lookup_by_subdomain("DEMO1").is_some());
    }

    #[test]
    fn reserved_subdomain_rejected_without_mutation() {
        let reg = registry();
        // Reserved wins over grammar: "api" is shorter than the minimum
        // label length but still answers as taken.
        for label in ["api", "www", "admin"] {
            let err = reg
                .register(&channel("ch1"), Some(label), 8080, None)
                .unwrap_err();
            assert_eq!(err.code, ErrorCode::SubdomainTaken, "label {label}");
        }
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn duplicate_subdomain_rejected_across_channels() {
        let reg = registry();
        reg.register(&channel("ch1"), Some("hello42"), 8080, None)
            .unwrap();
        let err = reg
            .register(&channel("ch2"), Some("hello42"), 9090, None)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SubdomainTaken);
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn invalid_grammar_rejected() {
        let reg = registry();
        for label in ["abc", "-abcd", "abcd-", "ab.cd"] {
            let err = reg
                .register(&channel("ch1"), Some(label), 8080, None)
                .unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidSubdomain, "label {label}");
        }
    }

    #[test]
    fn generated_subdomains_are_unique_and_valid() {
        let reg = registry();
        let ch = channel("ch1");
        let a = reg.register(&ch, None, 8080, None).unwrap();
        let b = reg.register(&ch, None, 8080, None).unwrap();
        assert_ne!(a.subdomain, b.subdomain);
        assert!(crate::ids::is_valid_subdomain(&a.subdomain));
        assert_eq!(a.subdomain.len(), 8);
    }

    #[test]
    fn channel_cap_off_by_one() {
        let (events, _) = broadcast::channel(16);
        let reg = TunnelRegistry::new(3, events);
        let ch = channel("ch1");
        for _ in 0..3 {
            reg.register(&ch, None, 8080, None).unwrap();
        }
        let err = reg.register(&ch, None, 8080, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::TunnelLimitExceeded);
        assert_eq!(reg.list_by_channel("ch1").len(), 3);
    }

    #[test]
    fn close_is_idempotent_and_unlinks_everything() {
        let reg = registry();
        let ch = channel("ch1");
        let t = reg.register(&ch, Some("demo1"), 8080, None).unwrap();

        assert!(reg.close(&t.id, "test"));
        assert!(!reg.close(&t.id, "test"));
        assert!(reg.lookup_by_subdomain("demo1").is_none());
        assert!(reg.lookup_by_id(&t.id).is_none());
        assert!(reg.list_by_channel("ch1").is_empty());
    }

    #[tokio::test]
    async fn close_fails_surviving_pending_requests() {
        let reg = registry();
        let ch = channel("ch1");
        let t = reg.register(&ch, Some("demo1"), 8080, None).unwrap();
        let rx = t.pending.insert("00ff00ff00ff00ff");

        reg.close(&t.id, "Client disconnected");

        match rx.await.unwrap() {
            pending::Completion::Error { code, message } => {
                assert_eq!(code, "REQUEST_FAILED");
                assert!(message.contains("Tunnel closed"));
            }
            pending::Completion::Response(_) => panic!("expected error"),
        }
        assert!(t.pending.is_empty());
    }

    #[test]
    fn close_all_for_channel_leaves_other_channels_untouched() {
        let reg = registry();
        let ch1 = channel("ch1");
        let ch2 = channel("ch2");
        reg.register(&ch1, None, 8080, None).unwrap();
        reg.register(&ch1, None, 8080, None).unwrap();
        reg.register(&ch2, Some("keepme42"), 8080, None).unwrap();

        reg.close_all_for_channel("ch1", "Client disconnected");

        assert!(reg.list_by_channel("ch1").is_empty());
        assert_eq!(reg.count(), 1);
        assert!(reg.lookup_by_subdomain("keepme42").is_some());
    }

    #[test]
    fn close_all_empties_the_registry() {
        let reg = registry();
        reg.register(&channel("ch1"), None, 8080, None).unwrap();
        reg.register(&channel("ch2"), None, 8080, None).unwrap();
        reg.close_all("Server shutdown");
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn events_published_on_create_and_close() {
        let (events, mut rx) = broadcast::channel(16);
        let reg = TunnelRegistry::new(10, events);
        let t = reg
            .register(&channel("ch1"), Some("demo1"), 8080, None)
            .unwrap();
        reg.close(&t.id, "test");

        let created = rx.try_recv().unwrap();
        assert_eq!(created["type"], "tunnel.created");
        assert_eq!(created["tunnel"]["subdomain"], "demo1");
        let closed = rx.try_recv().unwrap();
        assert_eq!(closed["type"], "tunnel.closed");
        assert_eq!(closed["reason"], "test");
    }
}
