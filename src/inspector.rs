//! Bounded in-memory capture of forwarded request/response pairs.
//!
//! ## Design
//!
//! Three indices share one exchange set: a global insertion-ordered buffer,
//! a per-tunnel buffer, and a map by request id. `record_request` inserts
//! into all three; `record_response` mutates the stored exchange in place.
//! Bounds are enforced on every insert — the global buffer is trimmed
//! oldest-first to `max_entries`, each tunnel to half that — and a periodic
//! sweep drops exchanges older than the retention window. Queries never
//! return an expired exchange even between sweeps.
//!
//! Recording is best-effort: accessors take a plain `Mutex` briefly, never
//! await, and a poisoned lock is recovered rather than propagated so the
//! forwarder's hot path cannot be broken from here.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::util::now_millis;

/// Header names whose values are replaced by `[REDACTED]` when a caller
/// asks for sanitized output.
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie", "x-api-key"];

/// The request half of a captured exchange.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub method: String,
    /// Original path plus query string.
    pub path: String,
    pub headers: HashMap<String, String>,
    /// Base64 of the raw body bytes, `None` when the request had none.
    pub body: Option<String>,
    pub query: HashMap<String, String>,
    pub client_ip: String,
    pub timestamp: u64,
}

/// The response half, filled in when the exchange resolves.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: u64,
}

impl ResponseRecord {
    /// A response that never happened — timeout, teardown, agent failure.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status_code: None,
            headers: HashMap::new(),
            body: None,
            error: Some(error.into()),
            timestamp: now_millis(),
        }
    }
}

/// One recorded request plus its eventual response or error.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedExchange {
    pub request_id: String,
    pub tunnel_id: String,
    pub subdomain: String,
    pub request: RequestRecord,
    pub response: Option<ResponseRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    pub recorded_at: u64,
}

impl CapturedExchange {
    fn sanitized(&self) -> Self {
        let mut copy = self.clone();
        redact(&mut copy.request.headers);
        if let Some(resp) = copy.response.as_mut() {
            redact(&mut resp.headers);
        }
        copy
    }
}

fn redact(headers: &mut HashMap<String, String>) {
    for (name, value) in headers.iter_mut() {
        if SENSITIVE_HEADERS.iter().any(|s| name.eq_ignore_ascii_case(s)) {
            *value = "[REDACTED]".to_string();
        }
    }
}

/// Query filter for [`InspectorStore::list`].
pub struct TrafficFilter {
    /// Exact method match, case-insensitive.
    pub method: Option<String>,
    /// Exact response status match.
    pub status_code: Option<u16>,
    /// Case-insensitive regex over the captured path.
    pub path: Option<Regex>,
    /// Only exchanges whose request instant is at or after this.
    pub since: Option<u64>,
    pub limit: usize,
    pub offset: usize,
    pub sanitize: bool,
}

impl Default for TrafficFilter {
    fn default() -> Self {
        Self {
            method: None,
            status_code: None,
            path: None,
            since: None,
            limit: 50,
            offset: 0,
            sanitize: false,
        }
    }
}

impl TrafficFilter {
    fn matches(&self, ex: &CapturedExchange) -> bool {
        if let Some(m) = &self.method {
            if !ex.request.method.eq_ignore_ascii_case(m) {
                return false;
            }
        }
        if let Some(status) = self.status_code {
            if ex.response.as_ref().and_then(|r| r.status_code) != Some(status) {
                return false;
            }
        }
        if let Some(re) = &self.path {
            if !re.is_match(&ex.request.path) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if ex.request.timestamp < since {
                return false;
            }
        }
        true
    }
}

/// One page of query results.
pub struct TrafficPage {
    pub entries: Vec<CapturedExchange>,
    /// Matching exchanges before pagination.
    pub total: usize,
}

#[derive(Default)]
struct Inner {
    /// Request ids, oldest first.
    order: VecDeque<String>,
    per_tunnel: HashMap<String, VecDeque<String>>,
    by_id: HashMap<String, CapturedExchange>,
}

impl Inner {
    fn evict(&mut self, request_id: &str) {
        let Some(ex) = self.by_id.remove(request_id) else {
            return;
        };
        if let Some(pos) = self.order.iter().position(|id| id == request_id) {
            self.order.remove(pos);
        }
        if let Some(buffer) = self.per_tunnel.get_mut(&ex.tunnel_id) {
            if let Some(pos) = buffer.iter().position(|id| id == request_id) {
                buffer.remove(pos);
            }
            if buffer.is_empty() {
                self.per_tunnel.remove(&ex.tunnel_id);
            }
        }
    }
}

/// Bounded store of [`CapturedExchange`] records with query support.
pub struct InspectorStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<Value>,
    max_entries: usize,
    per_tunnel_cap: usize,
    retention_ms: u64,
}

impl InspectorStore {
    pub fn new(max_entries: usize, retention_secs: u64, events: broadcast::Sender<Value>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            events,
            max_entries,
            per_tunnel_cap: (max_entries / 2).max(1),
            retention_ms: retention_secs.saturating_mul(1000),
        }
    }

    /// Record a request about to be forwarded. Inserts into all three
    /// indices and enforces both bounds, evicting oldest-first.
    pub fn record_request(
        &self,
        request_id: &str,
        tunnel_id: &str,
        subdomain: &str,
        request: RequestRecord,
    ) {
        let event = json!({
            "type": "traffic.request",
            "requestId": request_id,
            "tunnelId": tunnel_id,
            "subdomain": subdomain,
            "method": request.method,
            "path": request.path,
        });

        let mut inner = self.lock();
        inner.by_id.insert(
            request_id.to_string(),
            CapturedExchange {
                request_id: request_id.to_string(),
                tunnel_id: tunnel_id.to_string(),
                subdomain: subdomain.to_string(),
                request,
                response: None,
                response_time_ms: None,
                recorded_at: now_millis(),
            },
        );
        inner.order.push_back(request_id.to_string());
        inner
            .per_tunnel
            .entry(tunnel_id.to_string())
            .or_default()
            .push_back(request_id.to_string());

        while inner.order.len() > self.max_entries {
            let Some(oldest) = inner.order.front().cloned() else {
                break;
            };
            inner.evict(&oldest);
        }
        while inner
            .per_tunnel
            .get(tunnel_id)
            .is_some_and(|b| b.len() > self.per_tunnel_cap)
        {
            let Some(oldest) = inner
                .per_tunnel
                .get(tunnel_id)
                .and_then(|b| b.front().cloned())
            else {
                break;
            };
            inner.evict(&oldest);
        }
        drop(inner);

        let _ = self.events.send(event);
    }

    /// Attach the outcome to a previously recorded request, in place. An
    /// orphaned response (no recorded request) is dropped with a warning.
    pub fn record_response(&self, request_id: &str, response: ResponseRecord, elapsed_ms: u64) {
        let mut inner = self.lock();
        let Some(ex) = inner.by_id.get_mut(request_id) else {
            drop(inner);
            warn!(request = %request_id, "Dropping response for unrecorded request");
            return;
        };
        let event = json!({
            "type": "traffic.response",
            "requestId": request_id,
            "tunnelId": ex.tunnel_id,
            "statusCode": response.status_code,
            "error": response.error,
            "responseTimeMs": elapsed_ms,
        });
        ex.response = Some(response);
        ex.response_time_ms = Some(elapsed_ms);
        drop(inner);

        let _ = self.events.send(event);
    }

    /// Query captured traffic, newest first. `tunnel_id` restricts the scan
    /// to one tunnel's buffer.
    pub fn list(&self, filter: &TrafficFilter, tunnel_id: Option<&str>) -> TrafficPage {
        let now = now_millis();
        let inner = self.lock();
        let ids: Vec<&String> = match tunnel_id {
            Some(t) => inner
                .per_tunnel
                .get(t)
                .map(|b| b.iter().rev().collect())
                .unwrap_or_default(),
            None => inner.order.iter().rev().collect(),
        };

        let matching: Vec<&CapturedExchange> = ids
            .into_iter()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|ex| self.fresh(ex, now) && filter.matches(ex))
            .collect();
        let total = matching.len();

        let entries = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .map(|ex| if filter.sanitize { ex.sanitized() } else { ex.clone() })
            .collect();

        TrafficPage { entries, total }
    }

    /// Fetch one exchange. Expired exchanges are never returned.
    pub fn get(&self, request_id: &str, sanitize: bool) -> Option<CapturedExchange> {
        let now = now_millis();
        let inner = self.lock();
        let ex = inner.by_id.get(request_id).filter(|ex| self.fresh(ex, now))?;
        Some(if sanitize { ex.sanitized() } else { ex.clone() })
    }

    /// Synthesize a shell `curl` command reproducing the captured request.
    ///
    /// Headers are emitted verbatim (sanitization applies only to queries);
    /// `host` and `content-length` are omitted because curl supplies its own.
    pub fn to_curl(&self, request_id: &str, public_domain: &str) -> Option<String> {
        self.get(request_id, false)
            .map(|ex| build_curl(&ex, public_domain))
    }

    /// Drop everything older than the retention window. Runs periodically.
    pub fn sweep_expired(&self) -> usize {
        let now = now_millis();
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .by_id
            .values()
            .filter(|ex| !self.fresh(ex, now))
            .map(|ex| ex.request_id.clone())
            .collect();
        let count = expired.len();
        for id in expired {
            inner.evict(&id);
        }
        drop(inner);
        if count > 0 {
            debug!(count, "Swept expired exchanges");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_id.is_empty()
    }

    fn fresh(&self, ex: &CapturedExchange, now: u64) -> bool {
        now.saturating_sub(ex.recorded_at) < self.retention_ms
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Build the curl command line for a captured request. Single quotes in
/// interpolated values are escaped as `'\''`.
fn build_curl(ex: &CapturedExchange, public_domain: &str) -> String {
    fn esc(s: &str) -> String {
        s.replace('\'', r"'\''")
    }

    let mut cmd = String::from("curl");
    if !ex.request.method.eq_ignore_ascii_case("GET") {
        cmd.push_str(&format!(" -X {}", ex.request.method));
    }

    let mut names: Vec<&String> = ex.request.headers.keys().collect();
    names.sort();
    for name in names {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        cmd.push_str(&format!(" -H '{}: {}'", esc(name), esc(&ex.request.headers[name])));
    }

    if let Some(b64) = &ex.request.body {
        let bytes = STANDARD.decode(b64).unwrap_or_default();
        cmd.push_str(&format!(" -d '{}'", esc(&String::from_utf8_lossy(&bytes))));
    }

    cmd.push_str(&format!(
        " 'https://{}.{}{}'",
        ex.subdomain, public_domain, ex.request.path
    ));
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_entries: usize, retention_secs: u64) -> InspectorStore {
        let (events, _) = broadcast::channel(64);
        InspectorStore::new(max_entries, retention_secs, events)
    }

    fn request(method: &str, path: &str) -> RequestRecord {
        RequestRecord {
            method: method.to_string(),
            path: path.to_string(),
            headers: HashMap::new(),
            body: None,
            query: HashMap::new(),
            client_ip: "127.0.0.1".to_string(),
            timestamp: now_millis(),
        }
    }

    fn ok_response(status: u16) -> ResponseRecord {
        ResponseRecord {
            status_code: Some(status),
            headers: HashMap::new(),
            body: None,
            error: None,
            timestamp: now_millis(),
        }
    }

    #[test]
    fn response_mutates_exchange_in_place() {
        let s = store(10, 3600);
        s.record_request("r1", "t1", "demo1", request("GET", "/ping"));
        s.record_response("r1", ok_response(200), 12);

        let ex = s.get("r1", false).unwrap();
        assert_eq!(ex.response.unwrap().status_code, Some(200));
        assert_eq!(ex.response_time_ms, Some(12));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn orphaned_response_is_dropped() {
        let s = store(10, 3600);
        s.record_response("ghost", ok_response(200), 5);
        assert!(s.is_empty());
    }

    #[test]
    fn global_bound_evicts_oldest_first() {
        // Distinct tunnels so the per-tunnel cap (floor(4/2)) stays out of
        // the way and the global bound is what evicts.
        let s = store(4, 3600);
        for i in 0..5 {
            s.record_request(
                &format!("r{i}"),
                &format!("t{i}"),
                "demo1",
                request("GET", &format!("/{i}")),
            );
        }
        assert_eq!(s.len(), 4);
        let page = s.list(&TrafficFilter { limit: 10, ..TrafficFilter::default() }, None);
        assert_eq!(page.entries.len(), 4);
        // Newest first, and the oldest (r0) is gone.
        assert_eq!(page.entries[0].request_id, "r4");
        assert!(page.entries.iter().all(|e| e.request_id != "r0"));
    }

    #[test]
    fn per_tunnel_bound_is_half_the_global() {
        let s = store(10, 3600);
        for i in 0..8 {
            s.record_request(&format!("r{i}"), "t1", "demo1", request("GET", "/x"));
        }
        let page = s.list(&TrafficFilter { limit: 50, ..TrafficFilter::default() }, Some("t1"));
        assert_eq!(page.entries.len(), 5);
        assert_eq!(page.entries[0].request_id, "r7");
        // Evicted ids are gone from the global index too.
        assert_eq!(s.len(), 5);
        assert!(s.get("r0", false).is_none());
    }

    #[test]
    fn expired_exchanges_are_invisible_and_swept() {
        let s = store(10, 0); // zero retention: everything expires instantly
        s.record_request("r1", "t1", "demo1", request("GET", "/ping"));
        assert!(s.get("r1", false).is_none());
        assert_eq!(s.list(&TrafficFilter::default(), None).entries.len(), 0);
        assert_eq!(s.sweep_expired(), 1);
        assert!(s.is_empty());
    }

    #[test]
    fn filters_combine() {
        let s = store(100, 3600);
        s.record_request("r1", "t1", "demo1", request("GET", "/users"));
        s.record_response("r1", ok_response(200), 3);
        s.record_request("r2", "t1", "demo1", request("POST", "/users"));
        s.record_response("r2", ok_response(201), 4);
        s.record_request("r3", "t1", "demo1", request("GET", "/Items"));
        s.record_response("r3", ok_response(404), 5);

        let by_method = s.list(
            &TrafficFilter {
                method: Some("post".to_string()),
                ..TrafficFilter::default()
            },
            None,
        );
        assert_eq!(by_method.entries.len(), 1);
        assert_eq!(by_method.entries[0].request_id, "r2");

        let by_status = s.list(
            &TrafficFilter {
                status_code: Some(404),
                ..TrafficFilter::default()
            },
            None,
        );
        assert_eq!(by_status.entries.len(), 1);

        let by_path = s.list(
            &TrafficFilter {
                path: Some(
                    regex::RegexBuilder::new("^/items")
                        .case_insensitive(true)
                        .build()
                        .unwrap(),
                ),
                ..TrafficFilter::default()
            },
            None,
        );
        assert_eq!(by_path.entries.len(), 1);
        assert_eq!(by_path.entries[0].request_id, "r3");
    }

    #[test]
    fn pagination_applies_after_filtering() {
        let s = store(100, 3600);
        for i in 0..10 {
            s.record_request(&format!("r{i}"), "t1", "demo1", request("GET", "/x"));
        }
        let page = s.list(
            &TrafficFilter {
                limit: 3,
                offset: 2,
                ..TrafficFilter::default()
            },
            None,
        );
        assert_eq!(page.total, 10);
        assert_eq!(page.entries.len(), 3);
        // Newest first: r9 r8 | r7 r6 r5 | ...
        assert_eq!(page.entries[0].request_id, "r7");
    }

    #[test]
    fn sanitize_redacts_sensitive_headers_on_the_copy_only() {
        let s = store(10, 3600);
        let mut req = request("GET", "/secret");
        req.headers
            .insert("Authorization".to_string(), "Bearer s3cret".to_string());
        req.headers
            .insert("Cookie".to_string(), "session=abc".to_string());
        req.headers
            .insert("x-api-key".to_string(), "key123".to_string());
        req.headers
            .insert("accept".to_string(), "*/*".to_string());
        s.record_request("r1", "t1", "demo1", req);
        let mut resp = ok_response(200);
        resp.headers
            .insert("Set-Cookie".to_string(), "session=def".to_string());
        s.record_response("r1", resp, 2);

        let clean = s.get("r1", true).unwrap();
        assert_eq!(clean.request.headers["Authorization"], "[REDACTED]");
        assert_eq!(clean.request.headers["Cookie"], "[REDACTED]");
        assert_eq!(clean.request.headers["x-api-key"], "[REDACTED]");
        assert_eq!(clean.request.headers["accept"], "*/*");
        assert_eq!(clean.response.unwrap().headers["Set-Cookie"], "[REDACTED]");

        // The stored original is untouched.
        let raw = s.get("r1", false).unwrap();
        assert_eq!(raw.request.headers["Authorization"], "Bearer s3cret");
    }

    #[test]
    fn curl_synthesis_matches_contract() {
        let s = store(10, 3600);
        let mut req = request("POST", "/x");
        req.headers.insert(
            "content-type".to_string(),
            "application/json".to_string(),
        );
        req.headers
            .insert("authorization".to_string(), "Bearer s3cret".to_string());
        req.headers.insert("host".to_string(), "demo1.example.com".to_string());
        req.headers.insert("content-length".to_string(), "7".to_string());
        req.body = Some(STANDARD.encode(r#"{"a":1}"#));
        s.record_request("r1", "t1", "demo1", req);

        let curl = s.to_curl("r1", "example.com").unwrap();
        assert!(curl.contains("-X POST"));
        assert!(curl.contains("-H 'content-type: application/json'"));
        // Sanitization applies to queries, not curl synthesis.
        assert!(curl.contains("-H 'authorization: Bearer s3cret'"));
        assert!(!curl.contains("host:"));
        assert!(!curl.contains("content-length:"));
        assert!(curl.contains(r#"-d '{"a":1}'"#));
        assert!(curl.ends_with("'https://demo1.example.com/x'"));
    }

    #[test]
    fn curl_omits_x_flag_for_get_and_escapes_quotes() {
        let s = store(10, 3600);
        let mut req = request("GET", "/q");
        req.headers
            .insert("x-note".to_string(), "it's fine".to_string());
        s.record_request("r1", "t1", "demo1", req);

        let curl = s.to_curl("r1", "example.com").unwrap();
        assert!(!curl.contains("-X"));
        assert!(curl.contains(r"-H 'x-note: it'\''s fine'"));
    }

    #[test]
    fn events_emitted_for_request_and_response() {
        let (events, mut rx) = broadcast::channel(16);
        let s = InspectorStore::new(10, 3600, events);
        s.record_request("r1", "t1", "demo1", request("GET", "/ping"));
        s.record_response("r1", ok_response(200), 1);

        assert_eq!(rx.try_recv().unwrap()["type"], "traffic.request");
        assert_eq!(rx.try_recv().unwrap()["type"], "traffic.response");
    }
}
