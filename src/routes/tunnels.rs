//! Tunnel listing and gateway statistics endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;

use crate::error::{ErrorCode, GatewayError};
use crate::state::GatewayState;

/// `GET /api/tunnels` — stats for every live tunnel.
pub async fn list_tunnels(State(state): State<GatewayState>) -> Json<Value> {
    let tunnels: Vec<Value> = state.registry.list_all().iter().map(|t| t.stats()).collect();
    let count = tunnels.len();
    Json(json!({"tunnels": tunnels, "count": count}))
}

/// `GET /api/tunnels/{id}` — one tunnel's stats, or 404.
pub async fn get_tunnel(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    state
        .registry
        .lookup_by_id(&id)
        .map(|t| Json(t.stats()))
        .ok_or_else(|| {
            GatewayError::new(ErrorCode::TunnelNotFound, format!("No tunnel with id '{id}'"))
        })
}

/// `GET /api/stats` — process-wide counters and derived rates.
pub async fn stats(State(state): State<GatewayState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let requests_total = state.stats.requests_total.load(Ordering::Relaxed);
    #[allow(clippy::cast_precision_loss)]
    let requests_per_second = if uptime > 0 {
        requests_total as f64 / uptime as f64
    } else {
        requests_total as f64
    };

    Json(json!({
        "uptime": uptime,
        "tunnels": state.registry.count(),
        "channels": state.channels.len(),
        "channelList": state.channels.snapshot(),
        "requestsTotal": requests_total,
        "requestsFailed": state.stats.requests_failed.load(Ordering::Relaxed),
        "bytesIn": state.stats.bytes_in.load(Ordering::Relaxed),
        "bytesOut": state.stats.bytes_out.load(Ordering::Relaxed),
        "requestsPerSecond": requests_per_second,
        "trafficStored": state.inspector.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHandle;
    use crate::config::Config;

    #[tokio::test]
    async fn listing_reflects_registrations() {
        let state = GatewayState::new(Config::default());
        let (handle, _rx) =
            ChannelHandle::open("ch1".to_string(), "127.0.0.1:50000".to_string(), 16);
        let tunnel = state
            .registry
            .register(&handle, Some("demo1"), 8080, None)
            .unwrap();

        let Json(body) = list_tunnels(State(state.clone())).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["tunnels"][0]["subdomain"], "demo1");

        let Json(one) = get_tunnel(State(state.clone()), Path(tunnel.id.clone()))
            .await
            .unwrap();
        assert_eq!(one["localPort"], 8080);

        let err = get_tunnel(State(state), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TunnelNotFound);
    }

    #[tokio::test]
    async fn stats_shape() {
        let state = GatewayState::new(Config::default());
        let Json(body) = stats(State(state)).await;
        assert_eq!(body["tunnels"], 0);
        assert_eq!(body["requestsTotal"], 0);
        assert!(body["requestsPerSecond"].is_number());
    }
}
