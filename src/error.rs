//! Gateway error taxonomy and JSON error replies.
//!
//! Every error surfaced to a client — over the public HTTP side or as an
//! `error` payload on a control channel — carries a code from the closed
//! [`ErrorCode`] set. Validation errors are answered locally and never
//! terminate a channel; transport errors are fatal to their channel only.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Closed set of error codes carried in HTTP replies and control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ConnectionFailed,
    ConnectionClosed,
    ConnectionTimeout,
    TunnelNotFound,
    TunnelLimitExceeded,
    SubdomainTaken,
    InvalidSubdomain,
    RequestTimeout,
    RequestFailed,
    InvalidRequest,
    BodyTooLarge,
    Unauthorized,
    InvalidToken,
    TokenExpired,
    RateLimited,
    LocalServerError,
    LocalServerUnreachable,
    InvalidMessage,
    UnknownMessage,
    GenericError,
}

impl ErrorCode {
    /// Wire representation, stable for clients.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::TunnelNotFound => "TUNNEL_NOT_FOUND",
            Self::TunnelLimitExceeded => "TUNNEL_LIMIT_EXCEEDED",
            Self::SubdomainTaken => "SUBDOMAIN_TAKEN",
            Self::InvalidSubdomain => "INVALID_SUBDOMAIN",
            Self::RequestTimeout => "REQUEST_TIMEOUT",
            Self::RequestFailed => "REQUEST_FAILED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::BodyTooLarge => "BODY_TOO_LARGE",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::RateLimited => "RATE_LIMITED",
            Self::LocalServerError => "LOCAL_SERVER_ERROR",
            Self::LocalServerUnreachable => "LOCAL_SERVER_UNREACHABLE",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::UnknownMessage => "UNKNOWN_MESSAGE",
            Self::GenericError => "GENERIC_ERROR",
        }
    }

    /// HTTP status used when this code reaches the public surface.
    #[must_use]
    pub fn http_status(self) -> StatusCode {
        match self {
            Self::TunnelNotFound => StatusCode::NOT_FOUND,
            Self::RequestTimeout | Self::ConnectionTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::RequestFailed
            | Self::ConnectionClosed
            | Self::ConnectionFailed
            | Self::LocalServerError
            | Self::LocalServerUnreachable => StatusCode::BAD_GATEWAY,
            Self::InvalidRequest
            | Self::InvalidSubdomain
            | Self::InvalidMessage
            | Self::UnknownMessage => StatusCode::BAD_REQUEST,
            Self::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::SubdomainTaken => StatusCode::CONFLICT,
            Self::Unauthorized | Self::InvalidToken | Self::TokenExpired => {
                StatusCode::UNAUTHORIZED
            }
            Self::RateLimited | Self::TunnelLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::GenericError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// An error with a taxonomy code and a human-readable message.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GatewayError {
    pub code: ErrorCode,
    pub message: String,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (
            self.code.http_status(),
            Json(json!({"error": self.message, "code": self.code.as_str()})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_to_504() {
        assert_eq!(
            ErrorCode::RequestTimeout.http_status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(ErrorCode::TunnelNotFound.http_status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn wire_codes_are_screaming_snake() {
        assert_eq!(ErrorCode::SubdomainTaken.as_str(), "SUBDOMAIN_TAKEN");
        assert_eq!(ErrorCode::BodyTooLarge.as_str(), "BODY_TOO_LARGE");
    }
}
