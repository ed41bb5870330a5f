//! The HTTP-facing error taxonomy for the ingress dispatcher. Every variant
//! maps to exactly one caller-visible status code; operator-relevant detail
//! goes to the logs, not the response body, to avoid identity enumeration.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

#[derive(Debug)]
pub enum IngressError {
    /// Missing or malformed `Host` header.
    BadRequest(&'static str),
    /// Identity is unknown, unresolved, or has no connected client.
    TunnelOffline,
    /// Request body exceeds the configured ingress cap.
    TooLarge,
    /// Per-identity rate limit exceeded; seconds until the caller may retry.
    RateLimited(u64),
    /// Per-request deadline elapsed before a response frame arrived.
    Timeout,
    /// The alias resolver or an upstream dependency failed.
    Upstream(String),
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            Self::TunnelOffline => (StatusCode::BAD_GATEWAY, "tunnel offline").into_response(),
            Self::TooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "request entity too large").into_response(),
            Self::RateLimited(retry_after) => {
                let mut res = (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
                res.headers_mut().insert(
                    "retry-after",
                    HeaderValue::from_str(&retry_after.to_string()).unwrap(),
                );
                res
            }
            Self::Timeout => (StatusCode::GATEWAY_TIMEOUT, "upstream timed out").into_response(),
            Self::Upstream(detail) => {
                log::warn!("upstream failure: {detail}");
                (StatusCode::BAD_GATEWAY, "tunnel offline").into_response()
            }
        }
    }
}
