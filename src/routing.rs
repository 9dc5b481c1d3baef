//! Prefix routing table.
//!
//! The first path segment selects the backend. Matching is exact and
//! case-sensitive; the matched segment is stripped and the remainder of the
//! path is forwarded unchanged.

use crate::config::BackendConfig;

/// One entry of the routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// First path segment selecting this backend
    pub prefix: String,
    /// Backend service name (for logs)
    pub name: String,
    /// Backend port on 127.0.0.1
    pub port: u16,
}

/// Result of a successful lookup
#[derive(Debug, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    /// Path to send downstream, always starting with `/`
    pub rest: &'a str,
}

/// Immutable prefix → backend table, built once at startup
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Build the table from backend configs, in declared order
    pub fn from_backends(backends: &[BackendConfig]) -> Self {
        Self::new(
            backends
                .iter()
                .map(|b| Route {
                    prefix: b.prefix.clone(),
                    name: b.name.clone(),
                    port: b.port,
                })
                .collect(),
        )
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Resolve a request path. Linear scan; the table holds a handful of entries.
    pub fn resolve<'a>(&'a self, path: &'a str) -> Option<RouteMatch<'a>> {
        let (segment, rest) = split_first_segment(path)?;
        self.routes
            .iter()
            .find(|route| route.prefix == segment)
            .map(|route| RouteMatch { route, rest })
    }
}

/// Split `/seg/rest...` into `("seg", "/rest...")`.
///
/// `/seg` and `/seg/` both yield `/` as the remainder. Returns `None` for
/// paths without a leading slash or with an empty first segment.
pub fn split_first_segment(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.strip_prefix('/')?;
    let (segment, rest) = match trimmed.find('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
        None => (trimmed, "/"),
    };
    if segment.is_empty() {
        return None;
    }
    Some((segment, rest))
}

/// Downstream request target: remainder plus the original query, if non-empty
pub fn downstream_target(rest: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{}?{}", rest, q),
        _ => rest.to_string(),
    }
}
