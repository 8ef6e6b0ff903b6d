//! Traffic inspector endpoints.
//!
//! `GET /api/traffic?method&statusCode&path&since&limit&offset&sanitize`
//! plus per-tunnel, per-exchange, and curl-synthesis views.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use regex::RegexBuilder;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ErrorCode, GatewayError};
use crate::inspector::TrafficFilter;
use crate::state::GatewayState;

/// Query parameters shared by the traffic listing endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficQuery {
    pub method: Option<String>,
    pub status_code: Option<u16>,
    /// Case-insensitive regex over the captured path.
    pub path: Option<String>,
    /// Millisecond instant; only newer exchanges are returned.
    pub since: Option<u64>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub sanitize: bool,
}

fn default_limit() -> usize {
    50
}

impl TrafficQuery {
    fn into_filter(self) -> Result<TrafficFilter, GatewayError> {
        let path = match self.path {
            Some(pattern) => Some(
                RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        GatewayError::new(
                            ErrorCode::InvalidRequest,
                            format!("Invalid path filter: {e}"),
                        )
                    })?,
            ),
            None => None,
        };
        Ok(TrafficFilter {
            method: self.method,
            status_code: self.status_code,
            path,
            since: self.since,
            limit: self.limit,
            offset: self.offset,
            sanitize: self.sanitize,
        })
    }
}

/// `GET /api/traffic` — filtered page over all captured exchanges.
pub async fn list_traffic(
    State(state): State<GatewayState>,
    Query(query): Query<TrafficQuery>,
) -> Result<Json<Value>, GatewayError> {
    let limit = query.limit;
    let offset = query.offset;
    let page = state.inspector.list(&query.into_filter()?, None);
    Ok(Json(json!({
        "traffic": page.entries,
        "count": page.entries.len(),
        "total": page.total,
        "limit": limit,
        "offset": offset,
    })))
}

/// `GET /api/traffic/tunnel/{tunnelId}` — filtered page for one tunnel.
pub async fn tunnel_traffic(
    State(state): State<GatewayState>,
    Path(tunnel_id): Path<String>,
    Query(query): Query<TrafficQuery>,
) -> Result<Json<Value>, GatewayError> {
    let limit = query.limit;
    let offset = query.offset;
    let page = state.inspector.list(&query.into_filter()?, Some(&tunnel_id));
    Ok(Json(json!({
        "tunnelId": tunnel_id,
        "traffic": page.entries,
        "count": page.entries.len(),
        "total": page.total,
        "limit": limit,
        "offset": offset,
    })))
}

/// `GET /api/traffic/{requestId}` — one exchange, or 404.
pub async fn get_exchange(
    State(state): State<GatewayState>,
    Path(request_id): Path<String>,
    Query(query): Query<TrafficQuery>,
) -> Response {
    match state.inspector.get(&request_id, query.sanitize) {
        Some(exchange) => Json(exchange).into_response(),
        None => not_found(&request_id),
    }
}

/// `GET /api/traffic/{requestId}/curl` — shell command reproducing the
/// captured request, or 404.
pub async fn get_curl(
    State(state): State<GatewayState>,
    Path(request_id): Path<String>,
) -> Response {
    match state
        .inspector
        .to_curl(&request_id, &state.config.server.public_domain)
    {
        Some(curl) => Json(json!({"curl": curl})).into_response(),
        None => not_found(&request_id),
    }
}

fn not_found(request_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": format!("No captured exchange for request id '{request_id}'"),
            "code": ErrorCode::GenericError.as_str(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::inspector::RequestRecord;
    use crate::util::now_millis;
    use std::collections::HashMap;

    fn seeded_state() -> GatewayState {
        let state = GatewayState::new(Config::default());
        state.inspector.record_request(
            "00ff00ff00ff00ff",
            "t1",
            "demo1",
            RequestRecord {
                method: "GET".to_string(),
                path: "/ping".to_string(),
                headers: HashMap::new(),
                body: None,
                query: HashMap::new(),
                client_ip: "127.0.0.1".to_string(),
                timestamp: now_millis(),
            },
        );
        state
    }

    fn query() -> TrafficQuery {
        TrafficQuery {
            method: None,
            status_code: None,
            path: None,
            since: None,
            limit: 50,
            offset: 0,
            sanitize: false,
        }
    }

    #[tokio::test]
    async fn listing_returns_captured_traffic() {
        let state = seeded_state();
        let Json(body) = list_traffic(State(state), Query(query())).await.unwrap();
        assert_eq!(body["count"], 1);
        assert_eq!(body["traffic"][0]["requestId"], "00ff00ff00ff00ff");
    }

    #[tokio::test]
    async fn invalid_path_regex_is_rejected() {
        let state = seeded_state();
        let mut q = query();
        q.path = Some("([".to_string());
        let err = list_traffic(State(state), Query(q)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn unknown_exchange_is_404() {
        let state = GatewayState::new(Config::default());
        let response = get_curl(State(state), Path("nope".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
