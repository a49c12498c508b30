//! Route lookup.
//!
//! # Design Decisions
//! - Immutable after construction (replaced wholesale on config reload)
//! - O(n) scan in priority order (acceptable for typical route counts)
//! - Explicit `None` rather than silent default

use std::sync::Arc;

use axum::http::Request;

use crate::config::RouteConfig;
use crate::routing::matcher::{HostMatcher, Matcher, PathPrefixMatcher, RouteMatcher};

/// A compiled route.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub upstream: String,
    pub strip_prefix: bool,
    pub rate_limit: Option<String>,
    pub dedupe: bool,
    pub priority: u32,
    matcher: RouteMatcher,
}

impl Route {
    pub fn from_config(config: &RouteConfig) -> Self {
        Self {
            name: config.name.clone(),
            upstream: config.upstream.clone(),
            strip_prefix: config.strip_prefix,
            rate_limit: config.rate_limit.clone(),
            dedupe: config.dedupe,
            priority: config.priority,
            matcher: RouteMatcher {
                host: config.host.as_deref().map(HostMatcher::new),
                path: config.path_prefix.as_deref().map(PathPrefixMatcher::new),
            },
        }
    }

    pub fn matches<B>(&self, req: &Request<B>) -> bool {
        self.matcher.matches(req)
    }

    /// Path to send upstream, with the route prefix removed when `strip_prefix` is set.
    pub fn upstream_path<'a>(&self, path: &'a str) -> &'a str {
        if !self.strip_prefix {
            return path;
        }
        let Some(prefix) = self.matcher.path.as_ref().map(PathPrefixMatcher::prefix) else {
            return path;
        };
        if prefix == "/" {
            return path;
        }
        match path.strip_prefix(prefix) {
            Some("") => "/",
            Some(rest) => rest,
            None => path,
        }
    }
}

/// Priority-ordered route table.
#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<Arc<Route>>,
}

impl Router {
    pub fn from_config(configs: &[RouteConfig]) -> Self {
        let mut routes: Vec<Arc<Route>> = configs
            .iter()
            .map(|c| Arc::new(Route::from_config(c)))
            .collect();
        // Stable sort keeps declaration order among equal priorities.
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { routes }
    }

    /// First matching route, highest priority first.
    pub fn match_request<B>(&self, req: &Request<B>) -> Option<Arc<Route>> {
        self.routes.iter().find(|r| r.matches(req)).cloned()
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn config(name: &str, prefix: &str, priority: u32) -> RouteConfig {
        RouteConfig {
            name: name.into(),
            host: None,
            path_prefix: Some(prefix.into()),
            upstream: "db".into(),
            strip_prefix: true,
            rate_limit: None,
            dedupe: false,
            priority,
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_priority_order() {
        let router = Router::from_config(&[
            config("catch-all", "/", 0),
            config("votes", "/api/ideas", 10),
            config("api", "/api", 5),
        ]);

        let name = |uri| router.match_request(&get(uri)).map(|r| r.name.clone());
        assert_eq!(name("/api/ideas/7/vote").as_deref(), Some("votes"));
        assert_eq!(name("/api/trips").as_deref(), Some("api"));
        assert_eq!(name("/health-ish").as_deref(), Some("catch-all"));
    }

    #[test]
    fn test_no_match() {
        let router = Router::from_config(&[config("api", "/api", 0)]);
        assert!(router.match_request(&get("/static/logo.png")).is_none());
    }

    #[test]
    fn test_upstream_path() {
        let route = Route::from_config(&config("trips", "/api/db", 0));
        assert_eq!(route.upstream_path("/api/db/trips"), "/trips");
        assert_eq!(route.upstream_path("/api/db"), "/");

        let keep = Route::from_config(&RouteConfig {
            strip_prefix: false,
            ..config("trips", "/api/db", 0)
        });
        assert_eq!(keep.upstream_path("/api/db/trips"), "/api/db/trips");
    }
}
