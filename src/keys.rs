//! Store key naming.
//!
//! Keys follow `{app_prefix}:{kind}:{identity}[:suffix]`. The layout is part of
//! the deployment contract: renaming a segment orphans every live counter.

use std::fmt;

/// Which algorithm owns a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimiterKind {
    FixedWindow,
    TokenBucket,
    LeakyBucket,
    SlidingWindow,
}

impl LimiterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterKind::FixedWindow => "fixed-window",
            LimiterKind::TokenBucket => "token-bucket",
            LimiterKind::LeakyBucket => "leaky-bucket",
            LimiterKind::SlidingWindow => "user-ratelimit",
        }
    }
}

impl fmt::Display for LimiterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds store keys for one limiter instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    app_prefix: String,
    kind: LimiterKind,
}

impl KeyBuilder {
    pub fn new(app_prefix: impl Into<String>, kind: LimiterKind) -> Self {
        Self {
            app_prefix: app_prefix.into(),
            kind,
        }
    }

    pub fn kind(&self) -> LimiterKind {
        self.kind
    }

    pub fn key(&self, identity: &str) -> String {
        let identity = sanitize_identity(identity);
        if self.app_prefix.is_empty() {
            format!("{}:{}", self.kind, identity)
        } else {
            format!("{}:{}:{}", self.app_prefix, self.kind, identity)
        }
    }

    pub fn key_with_suffix(&self, identity: &str, suffix: &str) -> String {
        format!("{}:{}", self.key(identity), suffix)
    }
}

/// Replaces whitespace and control characters so an identity stays one key segment.
/// `:` is left alone since IPv6 addresses contain it.
pub fn sanitize_identity(identity: &str) -> String {
    identity
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() || c.is_control() { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeyBuilder::new("app", LimiterKind::FixedWindow);
        assert_eq!(keys.key("203.0.113.5"), "app:fixed-window:203.0.113.5");
    }

    #[test]
    fn test_key_with_suffix() {
        let keys = KeyBuilder::new("app", LimiterKind::TokenBucket);
        assert_eq!(
            keys.key_with_suffix("user-1", "lastRefill"),
            "app:token-bucket:user-1:lastRefill"
        );
    }

    #[test]
    fn test_empty_prefix() {
        let keys = KeyBuilder::new("", LimiterKind::SlidingWindow);
        assert_eq!(keys.key("u"), "user-ratelimit:u");
    }

    #[test]
    fn test_sanitize_identity() {
        assert_eq!(sanitize_identity("  a b\tc\n "), "a_b_c");
        assert_eq!(sanitize_identity("2001:db8::1"), "2001:db8::1");
    }
}
