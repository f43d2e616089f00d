use crate::algorithms::Decision;
use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Writes the `X-RateLimit-*` headers (and `Retry-After` on denial) for a decision.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(HEADER_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(HEADER_REMAINING, HeaderValue::from(decision.remaining));
    if let Some(reset_at_ms) = decision.reset_at_ms {
        // Whole seconds since the epoch, rounded up.
        let reset_secs = (reset_at_ms + 999).div_euclid(1000);
        headers.insert(HEADER_RESET, HeaderValue::from(reset_secs));
    }
    if !decision.allowed {
        if let Some(retry_after_ms) = decision.retry_after_ms {
            headers.insert(
                HEADER_RETRY_AFTER,
                HeaderValue::from(retry_after_ms.div_ceil(1000).max(1)),
            );
        }
    }
}

pub fn rate_limited(decision: &Decision) -> Response {
    let mut response = (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
    apply_rate_limit_headers(response.headers_mut(), decision);
    response
}

pub fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized - No IP address found").into_response()
}

/// Debug mode reports the remaining budget instead of running the handler.
pub fn debug_remaining(decision: &Decision) -> Response {
    let mut response = (StatusCode::OK, decision.remaining.to_string()).into_response();
    apply_rate_limit_headers(response.headers_mut(), decision);
    response
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub store_connected: bool,
}

impl HealthResponse {
    pub fn healthy(store_connected: bool) -> Self {
        Self::with_status("healthy", store_connected)
    }

    pub fn unhealthy(store_connected: bool) -> Self {
        Self::with_status("unhealthy", store_connected)
    }

    fn with_status(status: &str, store_connected: bool) -> Self {
        Self {
            status: status.to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            store_connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(allowed: bool) -> Decision {
        Decision {
            allowed,
            limit: 10,
            remaining: if allowed { 4 } else { 0 },
            reset_at_ms: Some(1_700_000_000_500),
            retry_after_ms: if allowed { None } else { Some(1_500) },
        }
    }

    #[test]
    fn test_headers_for_allowed_request() {
        let mut headers = HeaderMap::new();
        apply_rate_limit_headers(&mut headers, &decision(true));
        assert_eq!(headers[HEADER_LIMIT], "10");
        assert_eq!(headers[HEADER_REMAINING], "4");
        assert_eq!(headers[HEADER_RESET], "1700000001");
        assert!(headers.get(HEADER_RETRY_AFTER).is_none());
    }

    #[test]
    fn test_rate_limited_response() {
        let response = rate_limited(&decision(false));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[HEADER_RETRY_AFTER], "2");
    }

    #[test]
    fn test_health_response_serialization() {
        let json = serde_json::to_string(&HealthResponse::healthy(true)).unwrap();
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"store_connected\":true"));
    }
}
