//! Shared gateway state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::channel::ChannelTable;
use crate::config::Config;
use crate::inspector::InspectorStore;
use crate::registry::TunnelRegistry;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct GatewayState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Authoritative tunnel state.
    pub registry: Arc<TunnelRegistry>,
    /// Live control-channel bookkeeping.
    pub channels: Arc<ChannelTable>,
    /// Bounded capture of forwarded request/response pairs.
    pub inspector: Arc<InspectorStore>,
    /// Process-wide counters, updated lock-free on the hot path.
    pub stats: Arc<GatewayStats>,
    /// Broadcast bus carrying tunnel and traffic events for the dashboard
    /// surface. The main loop keeps a subscriber alive so emission never
    /// fails for lack of a listener.
    pub events: broadcast::Sender<Value>,
    /// Fired once on SIGINT/SIGTERM; every long-lived task subscribes.
    pub shutdown: broadcast::Sender<()>,
}

/// Cumulative counters — atomics for lock-free hot-path updates.
#[derive(Default)]
pub struct GatewayStats {
    pub requests_total: AtomicU64,
    pub requests_failed: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl GatewayState {
    pub fn new(config: Config) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = broadcast::channel(1);
        let registry = Arc::new(TunnelRegistry::new(
            config.tunnel.max_tunnels_per_channel,
            events.clone(),
        ));
        let inspector = Arc::new(InspectorStore::new(
            config.inspector.max_entries,
            config.inspector.retention_secs,
            events.clone(),
        ));
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            channels: Arc::new(ChannelTable::new()),
            inspector,
            stats: Arc::new(GatewayStats::default()),
            events,
            shutdown,
        }
    }
}
