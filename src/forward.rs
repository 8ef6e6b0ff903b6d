//! Request correlator / forwarder — the hot path.
//!
//! One task per inbound public request: resolve the tunnel, snapshot the
//! request, install a pending entry, emit `http:request` on the control
//! channel, then wait on the completion handle. The channel's receiver loop
//! resolves the handle via [`complete_request`] / [`fail_request`] when the
//! agent answers; a 30 s deadline and client disconnects resolve it the
//! other ways.
//!
//! The pending entry is removed exactly once across every terminal state —
//! reply, failure, timeout, and cancellation — the last by an RAII guard
//! that runs when the handler future is dropped mid-wait.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{ErrorCode, GatewayError};
use crate::ids;
use crate::inspector::{RequestRecord, ResponseRecord};
use crate::protocol::{ControlMessage, HttpErrorPayload, HttpRequestPayload, HttpResponsePayload};
use crate::registry::pending::{Completion, PendingTable};
use crate::registry::Tunnel;
use crate::state::GatewayState;
use crate::util::{client_ip, now_millis};

/// Headers confined to a single transport hop; never re-emitted on the
/// public response.
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "transfer-encoding", "upgrade"];

/// Removes the pending entry when dropped. Removal is idempotent, so the
/// normal resolution paths (which already removed it) are unaffected; the
/// guard exists for the path where the handler future is dropped because
/// the public client hung up.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.request_id);
    }
}

/// Forward one public HTTP request through the tunnel for `subdomain`.
pub async fn forward(state: &GatewayState, subdomain: &str, req: Request) -> Response {
    match forward_inner(state, subdomain, req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn forward_inner(
    state: &GatewayState,
    subdomain: &str,
    req: Request,
) -> Result<Response, GatewayError> {
    let tunnel = state.registry.lookup_by_subdomain(subdomain).ok_or_else(|| {
        GatewayError::new(
            ErrorCode::TunnelNotFound,
            format!("No tunnel registered for subdomain '{subdomain}'"),
        )
    })?;

    if !tunnel.channel.is_open() {
        return Err(GatewayError::new(
            ErrorCode::ConnectionClosed,
            "Control channel for this tunnel is closed",
        ));
    }

    // Snapshot the request before any suspension.
    let (parts, body) = req.into_parts();
    let method = parts.method.as_str().to_string();
    let path = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);
    let query: HashMap<String, String> = parts
        .uri
        .query()
        .and_then(|q| serde_urlencoded::from_str(q).ok())
        .unwrap_or_default();
    let headers: HashMap<String, String> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());
    let remote_ip = client_ip(&parts.headers, peer.as_deref());

    let body_bytes = axum::body::to_bytes(body, state.config.server.max_body_bytes)
        .await
        .map_err(|_| GatewayError::new(ErrorCode::BodyTooLarge, "Request body too large"))?;
    let body_b64 = if body_bytes.is_empty() {
        None
    } else {
        Some(STANDARD.encode(&body_bytes))
    };

    let request_id = loop {
        let candidate = ids::generate_request_id();
        if !tunnel.pending.contains(&candidate) {
            break candidate;
        }
    };

    let started = Instant::now();
    state.stats.requests_total.fetch_add(1, Ordering::Relaxed);
    state
        .stats
        .bytes_in
        .fetch_add(body_bytes.len() as u64, Ordering::Relaxed);
    tunnel.record_request(body_bytes.len() as u64);

    // Best-effort capture; the inspector never blocks this path.
    state.inspector.record_request(
        &request_id,
        &tunnel.id,
        &tunnel.subdomain,
        RequestRecord {
            method: method.clone(),
            path: path.clone(),
            headers: headers.clone(),
            body: body_b64.clone(),
            query: query.clone(),
            client_ip: remote_ip,
            timestamp: now_millis(),
        },
    );

    // Pending entry goes in before the message goes out, so a reply can
    // never observe a missing entry.
    let completion_rx = tunnel.pending.insert(&request_id);
    let guard = PendingGuard {
        pending: &tunnel.pending,
        request_id: &request_id,
    };

    let message = ControlMessage::HttpRequest(HttpRequestPayload {
        request_id: request_id.clone(),
        method: method.clone(),
        path,
        headers,
        body: body_b64,
        query,
        timestamp: now_millis(),
    });
    if tunnel.channel.send(message).await.is_err() {
        state.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
        state
            .inspector
            .record_response(&request_id, ResponseRecord::failure("Control channel closed"), 0);
        return Err(GatewayError::new(
            ErrorCode::ConnectionClosed,
            "Failed to deliver request to the client agent",
        ));
    }

    let deadline = Duration::from_secs(state.config.tunnel.request_timeout_secs);
    let outcome = tokio::time::timeout(deadline, completion_rx).await;
    #[allow(clippy::cast_possible_truncation)]
    let elapsed_ms = started.elapsed().as_millis() as u64;
    drop(guard);

    match outcome {
        Ok(Ok(Completion::Response(payload))) => {
            deliver_response(state, &tunnel, &request_id, payload, elapsed_ms)
        }
        Ok(Ok(Completion::Error { code, message })) => {
            state.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
            tunnel.record_response(0);
            state
                .inspector
                .record_response(&request_id, ResponseRecord::failure(&message), elapsed_ms);
            Ok((
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": message, "code": code})),
            )
                .into_response())
        }
        Ok(Err(_)) => {
            // Sender vanished without resolving; treat as a teardown race.
            state.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
            state
                .inspector
                .record_response(&request_id, ResponseRecord::failure("Tunnel closed"), elapsed_ms);
            Err(GatewayError::new(ErrorCode::RequestFailed, "Tunnel closed"))
        }
        Err(_) => {
            tunnel.pending.remove(&request_id);
            state.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
            state
                .inspector
                .record_response(&request_id, ResponseRecord::failure("Gateway timeout"), elapsed_ms);
            warn!(request = %request_id, subdomain = %tunnel.subdomain, "Request timed out");
            Err(GatewayError::new(ErrorCode::RequestTimeout, "Gateway timeout"))
        }
    }
}

/// Translate the agent's `http:response` into the public HTTP response.
fn deliver_response(
    state: &GatewayState,
    tunnel: &Tunnel,
    request_id: &str,
    payload: HttpResponsePayload,
    elapsed_ms: u64,
) -> Result<Response, GatewayError> {
    let body = match &payload.body {
        Some(b64) => STANDARD.decode(b64).map_err(|_| {
            state.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
            state.inspector.record_response(
                request_id,
                ResponseRecord::failure("Undecodable response body"),
                elapsed_ms,
            );
            GatewayError::new(
                ErrorCode::RequestFailed,
                "Client agent sent an undecodable response body",
            )
        })?,
        None => Vec::new(),
    };

    tunnel.record_response(body.len() as u64);
    state
        .stats
        .bytes_out
        .fetch_add(body.len() as u64, Ordering::Relaxed);
    state.inspector.record_response(
        request_id,
        ResponseRecord {
            status_code: Some(payload.status_code),
            headers: payload.headers.clone(),
            body: payload.body.clone(),
            error: None,
            timestamp: now_millis(),
        },
        elapsed_ms,
    );

    let status =
        StatusCode::from_u16(payload.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in &payload.headers {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder.body(Body::from(body)).map_err(|e| {
        GatewayError::new(ErrorCode::GenericError, format!("Failed to build response: {e}"))
    })
}

/// Resolve a pending exchange with the agent's response. No-op when no
/// entry exists (timed out, cancelled, or never issued here).
pub fn complete_request(state: &GatewayState, channel_id: &str, payload: HttpResponsePayload) {
    let request_id = payload.request_id.clone();
    let Some(tunnel) = owning_tunnel(state, channel_id, &request_id) else {
        debug!(channel = %channel_id, request = %request_id, "Dropping response with no pending entry");
        return;
    };
    if !tunnel.pending.complete(&request_id, Completion::Response(payload)) {
        debug!(request = %request_id, "Pending entry already resolved, dropping response");
    }
}

/// Resolve a pending exchange with the agent's error. No-op when no entry
/// exists.
pub fn fail_request(state: &GatewayState, channel_id: &str, payload: HttpErrorPayload) {
    let Some(tunnel) = owning_tunnel(state, channel_id, &payload.request_id) else {
        debug!(channel = %channel_id, request = %payload.request_id, "Dropping error with no pending entry");
        return;
    };
    let resolved = tunnel.pending.complete(
        &payload.request_id,
        Completion::Error {
            code: payload.code,
            message: payload.error,
        },
    );
    if !resolved {
        debug!(request = %payload.request_id, "Pending entry already resolved, dropping error");
    }
}

/// Find the tunnel on this channel whose pending table holds `request_id`.
fn owning_tunnel(
    state: &GatewayState,
    channel_id: &str,
    request_id: &str,
) -> Option<std::sync::Arc<Tunnel>> {
    state
        .registry
        .list_by_channel(channel_id)
        .into_iter()
        .find(|t| t.pending.contains(request_id))
}
