//! Route matching logic.
//!
//! # Responsibilities
//! - Match host header (exact match, case-insensitive)
//! - Match path prefix (case-sensitive, segment aware)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Empty condition = always matches (wildcard)
//! - No regex to guarantee O(n) matching

use axum::http::Request;

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches<B>(&self, req: &Request<B>) -> bool;
}

/// Matches the Host header.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }
}

impl Matcher for HostMatcher {
    fn matches<B>(&self, req: &Request<B>) -> bool {
        req.headers()
            .get("host")
            .and_then(|h| h.to_str().ok())
            .map(|h| h.to_lowercase() == self.expected_host)
            .unwrap_or(false)
    }
}

/// Matches the request path prefix on a segment boundary, so `/api/trips`
/// matches `/api/trips` and `/api/trips/42` but not `/api/tripsx`.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        while prefix.len() > 1 && prefix.ends_with('/') {
            prefix.pop();
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn matches_path(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches<B>(&self, req: &Request<B>) -> bool {
        self.matches_path(req.uri().path())
    }
}

/// Host and path conditions combined with AND semantics.
#[derive(Debug, Clone, Default)]
pub struct RouteMatcher {
    pub host: Option<HostMatcher>,
    pub path: Option<PathPrefixMatcher>,
}

impl Matcher for RouteMatcher {
    fn matches<B>(&self, req: &Request<B>) -> bool {
        self.host.as_ref().map_or(true, |m| m.matches(req))
            && self.path.as_ref().map_or(true, |m| m.matches(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn req(uri: &str, host: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("Host", host)
            .body(Body::default())
            .unwrap()
    }

    #[test]
    fn test_host_matcher() {
        let matcher = HostMatcher::new("withme.travel");
        assert!(matcher.matches(&req("/", "withme.travel")));
        assert!(matcher.matches(&req("/", "WITHME.TRAVEL"))); // Case insensitive
        assert!(!matcher.matches(&req("/", "other.com")));
    }

    #[test]
    fn test_path_matcher() {
        let matcher = PathPrefixMatcher::new("/api/trips/");
        assert_eq!(matcher.prefix(), "/api/trips");

        assert!(matcher.matches(&req("http://withme.travel/api/trips", "x")));
        assert!(matcher.matches(&req("http://withme.travel/api/trips/42/members", "x")));
        assert!(!matcher.matches(&req("http://withme.travel/api/tripsx", "x")));
        assert!(!matcher.matches(&req("http://withme.travel/images", "x")));

        assert!(PathPrefixMatcher::new("/").matches(&req("/anything", "x")));
    }

    #[test]
    fn test_route_matcher_and_semantics() {
        let matcher = RouteMatcher {
            host: Some(HostMatcher::new("api.withme.travel")),
            path: Some(PathPrefixMatcher::new("/v1")),
        };
        assert!(matcher.matches(&req("/v1/trips", "api.withme.travel")));
        assert!(!matcher.matches(&req("/v1/trips", "withme.travel")));
        assert!(!matcher.matches(&req("/v2/trips", "api.withme.travel")));

        assert!(RouteMatcher::default().matches(&req("/", "x")));
    }
}
