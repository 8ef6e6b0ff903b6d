//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::GatewayState;

/// `GET /health` — liveness probe.
///
/// Returns `{"status":"ok","tunnels":N,"uptime":secs}`. Suitable for
/// load-balancer health checks.
pub async fn health(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "tunnels": state.registry.count(),
        "uptime": state.start_time.elapsed().as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn reports_ok_and_tunnel_count() {
        let state = GatewayState::new(Config::default());
        let Json(body) = health(State(state)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["tunnels"], 0);
        assert!(body["uptime"].is_u64());
    }
}
