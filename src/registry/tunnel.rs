//! The authoritative record of one active exposure.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};

use super::pending::PendingTable;
use crate::channel::ChannelHandle;
use crate::util::now_millis;

/// A live binding from a public subdomain to a client agent's local server,
/// reached over one control channel. Destroyed exactly once: by a client
/// `tunnel:close`, by the channel closing, or by server shutdown.
#[derive(Debug)]
pub struct Tunnel {
    /// Opaque 12-character identifier, unique for the process lifetime.
    pub id: String,
    /// Lowercase label selecting this tunnel from the Host header.
    pub subdomain: String,
    /// The channel that owns this tunnel.
    pub channel: ChannelHandle,
    /// Client-declared local port. Informational only.
    pub local_port: u16,
    /// Opaque token supplied at registration, carried verbatim.
    pub auth_token: Option<String>,
    pub created_at: u64,
    pub last_activity: AtomicU64,
    pub request_count: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    /// In-flight exchanges issued on this tunnel.
    pub pending: PendingTable,
}

impl Tunnel {
    pub fn new(
        id: String,
        subdomain: String,
        channel: ChannelHandle,
        local_port: u16,
        auth_token: Option<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id,
            subdomain,
            channel,
            local_port,
            auth_token,
            created_at: now,
            last_activity: AtomicU64::new(now),
            request_count: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            pending: PendingTable::new(),
        }
    }

    /// Count an inbound request and its body bytes.
    pub fn record_request(&self, body_bytes: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(body_bytes, Ordering::Relaxed);
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// Count the decoded bytes of a delivered response.
    pub fn record_response(&self, body_bytes: u64) {
        self.bytes_out.fetch_add(body_bytes, Ordering::Relaxed);
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// Stats projection served by `/api/tunnels` and carried on events.
    pub fn stats(&self) -> Value {
        json!({
            "tunnelId": self.id,
            "subdomain": self.subdomain,
            "localPort": self.local_port,
            "createdAt": self.created_at,
            "lastActivity": self.last_activity.load(Ordering::Relaxed),
            "requestCount": self.request_count.load(Ordering::Relaxed),
            "bytesIn": self.bytes_in.load(Ordering::Relaxed),
            "bytesOut": self.bytes_out.load(Ordering::Relaxed),
            "pendingRequests": self.pending.len(),
        })
    }
}
