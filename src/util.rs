//! Small helpers shared across modules.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;

/// Current Unix time in milliseconds.
///
/// Wire timestamps and inspector capture instants all use this clock.
pub fn now_millis() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Best-effort client IP: first entry of `X-Forwarded-For` when present,
/// otherwise the peer address the connection came in on.
pub fn client_ip(headers: &HeaderMap, peer: Option<&str>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| peer.map(ToString::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_for_wins_over_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, Some("192.168.1.5:1234")), "203.0.113.9");
    }

    #[test]
    fn falls_back_to_peer() {
        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some("192.168.1.5:1234")), "192.168.1.5:1234");
    }

    #[test]
    fn unknown_without_either() {
        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, None), "unknown");
    }
}
