//! Public HTTP entry: host-based dispatch.
//!
//! A middleware ahead of the API router classifies every request by its
//! Host header against the configured public domain:
//!
//! - the apex itself (and the `www` / `api` labels) falls through to the
//!   control surface — `/health`, `/api/*`, and the JSON banner;
//! - `<label>.<public-domain>` forwards through the tunnel for `label`;
//! - anything else is rejected — only exact suffix matches of the
//!   configured domain are routed, so a stray vanity host can never
//!   shadow the apex.

use axum::extract::{Request, State};
use axum::http::header::HOST;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::error::{ErrorCode, GatewayError};
use crate::forward;
use crate::state::GatewayState;

/// How a Host header maps onto the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKind {
    /// The apex domain or a label that serves the control surface.
    Apex,
    /// A tunnel request for the contained subdomain (lowercased).
    Tunnel(String),
    /// Neither the apex nor a single label under the public domain.
    Mismatch,
}

/// Classify a Host header value against the configured public domain.
/// Ports are ignored on both sides; matching is case-insensitive.
pub fn classify_host(host: &str, public_domain: &str) -> HostKind {
    let bare = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    let domain = public_domain
        .split(':')
        .next()
        .unwrap_or(public_domain)
        .to_ascii_lowercase();

    if bare == domain {
        return HostKind::Apex;
    }
    let Some(label) = bare.strip_suffix(&format!(".{domain}")) else {
        return HostKind::Mismatch;
    };
    if label == "www" || label == "api" {
        return HostKind::Apex;
    }
    if label.is_empty() || label.contains('.') {
        return HostKind::Mismatch;
    }
    HostKind::Tunnel(label.to_string())
}

/// Middleware: route tunnel hosts to the forwarder, everything else to the
/// control surface underneath.
pub async fn dispatch(State(state): State<GatewayState>, req: Request, next: Next) -> Response {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .or_else(|| req.uri().host().map(ToString::to_string))
        .unwrap_or_default();

    match classify_host(&host, &state.config.server.public_domain) {
        HostKind::Apex => next.run(req).await,
        HostKind::Tunnel(subdomain) => forward::forward(&state, &subdomain, req).await,
        HostKind::Mismatch => GatewayError::new(
            ErrorCode::InvalidRequest,
            format!("Host '{host}' does not match the configured public domain"),
        )
        .into_response(),
    }
}

/// Fallback for unmatched paths on the apex: a JSON banner.
pub async fn banner(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "publicDomain": state.config.server.public_domain,
        "tunnels": state.registry.count(),
    }))
}
