//! Caller identity resolution from proxy and CDN headers.
//!
//! Precedence, first valid address wins:
//! 1. `X-Forwarded-For`
//! 2. the provider headers in [`PROVIDER_HEADERS`], in order
//! 3. the RFC 7239 `Forwarded` header's `for=` parameter
//! 4. the caller-supplied fallback (usually the socket peer address)
//!
//! Only the first, client-nearest entry of a comma separated list is considered.

use axum::http::HeaderMap;
use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;

/// Provider-specific headers checked after `X-Forwarded-For`.
pub const PROVIDER_HEADERS: &[&str] = &[
    "cf-connecting-ip",         // Cloudflare
    "x-client-ip",
    "x-real-ip",                // Nginx
    "x-forwarded",
    "forwarded-for",
    "true-client-ip",           // Akamai, Cloudflare Enterprise
    "x-cluster-client-ip",      // Rackspace, Riverbed
    "fastly-client-ip",         // Fastly
    "x-forwarded-host",
    "x-original-forwarded-for", // AWS
    "x-coming-from",
    "via",
    "x-real-forwarded-for",
];

static FORWARDED_FOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:^|[;,]\s*)for=("[^"]*"|[^;,\s]+)"#).expect("valid forwarded regex")
});

/// Resolves the calling client's IP address, or `None` if no source yields a valid one.
pub fn client_ip(headers: &HeaderMap, fallback: Option<&str>) -> Option<String> {
    if let Some(ip) = header_str(headers, "x-forwarded-for").and_then(first_valid_entry) {
        return Some(ip);
    }

    for name in PROVIDER_HEADERS {
        if let Some(ip) = header_str(headers, name).and_then(first_valid_entry) {
            return Some(ip);
        }
    }

    if let Some(ip) = header_str(headers, "forwarded").and_then(parse_forwarded) {
        return Some(ip);
    }

    fallback.and_then(normalize_ip)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

fn first_valid_entry(value: &str) -> Option<String> {
    let first = value.split(',').next()?;
    normalize_ip(first)
}

/// Accepts a bare IPv4 or IPv6 literal, optionally wrapped in `[...]`.
/// IPv6 addresses come back in canonical lowercase form.
pub fn normalize_ip(candidate: &str) -> Option<String> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return None;
    }
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(trimmed);
    unbracketed.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

/// Extracts the node from the first `for=` parameter, e.g. `for="[2001:db8::1]:4711"`.
fn parse_forwarded(value: &str) -> Option<String> {
    let token = FORWARDED_FOR.captures(value)?.get(1)?.as_str();
    let node = token.trim_matches('"').trim();

    if let Some(rest) = node.strip_prefix('[') {
        // Bracketed IPv6, possibly followed by a port.
        let (address, _) = rest.split_once(']')?;
        return normalize_ip(address);
    }

    match node.rsplit_once(':') {
        // IPv4 with a port; a bare IPv6 literal has more than one colon.
        Some((address, port)) if !address.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            normalize_ip(address)
        }
        _ => normalize_ip(node),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for &(name, value) in pairs {
            map.append(name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_forwarded_for_first_hop() {
        let map = headers(&[("x-forwarded-for", "203.0.113.5, 10.0.0.1")]);
        assert_eq!(client_ip(&map, None).as_deref(), Some("203.0.113.5"));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut map = HeaderMap::new();
        map.insert(
            HeaderName::from_bytes(b"X-Forwarded-For").unwrap(),
            HeaderValue::from_static("198.51.100.1"),
        );
        assert_eq!(client_ip(&map, None).as_deref(), Some("198.51.100.1"));
    }

    #[test]
    fn test_invalid_forwarded_for_falls_through() {
        let map = headers(&[
            ("x-forwarded-for", "not-an-ip"),
            ("cf-connecting-ip", "198.51.100.7"),
        ]);
        assert_eq!(client_ip(&map, None).as_deref(), Some("198.51.100.7"));
    }

    #[test]
    fn test_fallback_address() {
        assert_eq!(
            client_ip(&HeaderMap::new(), Some("127.0.0.1")).as_deref(),
            Some("127.0.0.1")
        );
    }

    #[test]
    fn test_nothing_resolves() {
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
        assert_eq!(client_ip(&HeaderMap::new(), Some("unknown")), None);
    }

    #[test]
    fn test_provider_precedence() {
        let map = headers(&[
            ("x-real-ip", "192.0.2.10"),
            ("cf-connecting-ip", "192.0.2.20"),
            ("true-client-ip", "192.0.2.30"),
        ]);
        assert_eq!(client_ip(&map, None).as_deref(), Some("192.0.2.20"));
    }

    #[test]
    fn test_rejects_malformed_literals() {
        assert_eq!(normalize_ip("256.1.1.1"), None);
        assert_eq!(normalize_ip("1.2.3"), None);
        assert_eq!(normalize_ip("[1.2.3.4"), None);
        assert_eq!(normalize_ip("\"1.2.3.4\""), None);
        assert_eq!(normalize_ip("2001:db8:::1"), None);
    }

    #[test]
    fn test_ipv6_normalization() {
        assert_eq!(normalize_ip("[2001:DB8::1]").as_deref(), Some("2001:db8::1"));
        assert_eq!(normalize_ip("::1").as_deref(), Some("::1"));
    }

    #[test]
    fn test_via_with_protocol_is_skipped() {
        let map = headers(&[("via", "1.1 proxy.example"), ("forwarded", "for=192.0.2.60;proto=http")]);
        assert_eq!(client_ip(&map, None).as_deref(), Some("192.0.2.60"));
    }

    #[test]
    fn test_rfc7239_forms() {
        assert_eq!(
            parse_forwarded(r#"for="[2001:db8:cafe::17]:4711""#).as_deref(),
            Some("2001:db8:cafe::17")
        );
        assert_eq!(
            parse_forwarded("proto=https;For=192.0.2.43:8080, for=198.51.100.17").as_deref(),
            Some("192.0.2.43")
        );
        assert_eq!(parse_forwarded("for=_hidden"), None);
        assert_eq!(parse_forwarded("by=203.0.113.43"), None);
    }

    #[test]
    fn test_forwarded_is_checked_before_fallback() {
        let map = headers(&[("forwarded", "for=192.0.2.43")]);
        assert_eq!(client_ip(&map, Some("10.0.0.1")).as_deref(), Some("192.0.2.43"));
    }
}
