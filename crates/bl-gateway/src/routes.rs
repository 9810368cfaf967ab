//! Longest-prefix route table.

use std::collections::HashSet;

use bl_config::{ForwardedForPolicy, RouteConfig};
use reqwest::Url;

use crate::{GatewayError, Result};

/// One upstream mapping.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub path_prefix: String,
    /// Base URL; the forwarded path is appended to its path
    pub upstream: Url,
    pub auth_required: bool,
    /// Empty means any authenticated user
    pub allowed_users: HashSet<String>,
    pub strip_prefix: bool,
    pub forwarded_for: ForwardedForPolicy,
}

impl RouteEntry {
    pub fn new(path_prefix: impl Into<String>, upstream: &str) -> Result<Self> {
        let path_prefix = path_prefix.into();
        let invalid = |reason: String| GatewayError::InvalidRoute {
            prefix: path_prefix.clone(),
            reason,
        };

        if !path_prefix.starts_with('/') {
            return Err(invalid("prefix must start with '/'".to_string()));
        }
        let upstream = Url::parse(upstream).map_err(|e| invalid(format!("upstream '{upstream}': {e}")))?;
        if !matches!(upstream.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported upstream scheme '{}'", upstream.scheme())));
        }
        if upstream.query().is_some() {
            return Err(invalid("upstream must not carry a query".to_string()));
        }

        Ok(Self {
            path_prefix,
            upstream,
            auth_required: false,
            allowed_users: HashSet::new(),
            strip_prefix: false,
            forwarded_for: ForwardedForPolicy::Append,
        })
    }

    pub fn from_config(config: &RouteConfig) -> Result<Self> {
        let mut entry = Self::new(config.path_prefix.clone(), &config.upstream)?;
        entry.auth_required = config.auth_required;
        entry.allowed_users = config.allowed_users.iter().cloned().collect();
        entry.strip_prefix = config.strip_prefix;
        entry.forwarded_for = config.forwarded_for;
        Ok(entry)
    }

    pub fn with_auth(mut self, allowed_users: impl IntoIterator<Item = String>) -> Self {
        self.auth_required = true;
        self.allowed_users = allowed_users.into_iter().collect();
        self
    }

    pub fn with_strip_prefix(mut self) -> Self {
        self.strip_prefix = true;
        self
    }

    pub fn with_forwarded_for(mut self, policy: ForwardedForPolicy) -> Self {
        self.forwarded_for = policy;
        self
    }

    /// Whether `path` falls under this prefix on a segment boundary.
    pub fn matches(&self, path: &str) -> bool {
        let prefix = self.path_prefix.as_str();
        if prefix == "/" {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
            None => false,
        }
    }

    pub fn allows(&self, user: &str) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.contains(user)
    }

    /// Upstream URL for an incoming path and query.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let forwarded = if self.strip_prefix && self.path_prefix != "/" {
            let rest = path
                .strip_prefix(self.path_prefix.trim_end_matches('/'))
                .unwrap_or(path);
            if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{rest}")
            }
        } else {
            path.to_string()
        };

        let base = self.upstream.path().trim_end_matches('/');
        let mut url = self.upstream.clone();
        url.set_path(&format!("{base}{forwarded}"));
        url.set_query(query);
        url
    }
}

/// Canonical form of a request path: dot segments resolved (including
/// percent-encoded ones) and repeated slashes collapsed.
///
/// Routing, auth and the upstream URL all use this form, so a path cannot
/// match one route and reach the upstream as another. Returns `None` for paths
/// that climb above the root or smuggle a separator inside a segment.
pub fn normalize_path(raw: &str) -> Option<String> {
    if !raw.starts_with('/') {
        return None;
    }

    let mut segments: Vec<&str> = Vec::new();
    let mut trailing_slash = raw.ends_with('/');
    for segment in raw.split('/').filter(|s| !s.is_empty()) {
        let lowered = segment.to_ascii_lowercase();
        if lowered.contains("%2f") || lowered.contains("%5c") || segment.contains('\\') {
            return None;
        }
        match lowered.replace("%2e", ".").as_str() {
            "." => trailing_slash = true,
            ".." => {
                segments.pop()?;
                trailing_slash = true;
            }
            _ => {
                segments.push(segment);
                trailing_slash = raw.ends_with('/');
            }
        }
    }

    let mut path = format!("/{}", segments.join("/"));
    if trailing_slash && !segments.is_empty() {
        path.push('/');
    }
    Some(path)
}

/// Routes ordered longest prefix first.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<RouteEntry>) -> Result<Self> {
        let mut seen = HashSet::new();
        for route in &routes {
            if !seen.insert(route.path_prefix.clone()) {
                return Err(GatewayError::InvalidRoute {
                    prefix: route.path_prefix.clone(),
                    reason: "duplicate prefix".to_string(),
                });
            }
        }
        routes.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        Ok(Self { routes })
    }

    pub fn from_config(routes: &[RouteConfig]) -> Result<Self> {
        Self::new(routes.iter().map(RouteEntry::from_config).collect::<Result<Vec<_>>>()?)
    }

    pub fn resolve(&self, path: &str) -> Option<&RouteEntry> {
        self.routes.iter().find(|route| route.matches(path))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::new(vec![
            RouteEntry::new("/", "http://api:8000").unwrap(),
            RouteEntry::new("/monitoring", "http://monitor:8090").unwrap(),
            RouteEntry::new("/monitoring/admin", "http://monitor-admin:8091").unwrap(),
            RouteEntry::new("/pgadmin/", "http://pgadmin:80").unwrap(),
        ])
        .unwrap()
    }

    fn host_for(table: &RouteTable, path: &str) -> Option<String> {
        table
            .resolve(path)
            .and_then(|r| r.upstream.host_str().map(str::to_string))
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = table();
        assert_eq!(host_for(&table, "/monitoring/admin/users").as_deref(), Some("monitor-admin"));
        assert_eq!(host_for(&table, "/monitoring/queues").as_deref(), Some("monitor"));
        assert_eq!(host_for(&table, "/monitoring").as_deref(), Some("monitor"));
        assert_eq!(host_for(&table, "/tasks/1").as_deref(), Some("api"));
    }

    #[test]
    fn test_prefix_respects_segments() {
        let table = table();
        // not a segment of /monitoring
        assert_eq!(host_for(&table, "/monitoringx").as_deref(), Some("api"));
        assert_eq!(host_for(&table, "/pgadmin/browser").as_deref(), Some("pgadmin"));
    }

    #[test]
    fn test_no_catch_all_means_no_route() {
        let table = RouteTable::new(vec![RouteEntry::new("/docs", "http://api:8000").unwrap()]).unwrap();
        assert!(table.resolve("/admin").is_none());
        assert!(table.resolve("/").is_none());
    }

    #[test]
    fn test_target_url() {
        let route = RouteEntry::new("/minio", "http://minio:9001/console/").unwrap();
        assert_eq!(
            route.target_url("/minio/browser", Some("a=1")).as_str(),
            "http://minio:9001/console/minio/browser?a=1"
        );

        let stripped = route.clone().with_strip_prefix();
        assert_eq!(stripped.target_url("/minio/browser", None).as_str(), "http://minio:9001/console/browser");
        assert_eq!(stripped.target_url("/minio", None).as_str(), "http://minio:9001/console/");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/docs").as_deref(), Some("/docs"));
        assert_eq!(normalize_path("/pgadmin/").as_deref(), Some("/pgadmin/"));
        assert_eq!(normalize_path("/x/../docs").as_deref(), Some("/docs"));
        assert_eq!(normalize_path("/%2e%2e/docs"), None);
        assert_eq!(normalize_path("/a/%2E%2e/docs").as_deref(), Some("/docs"));
        assert_eq!(normalize_path("/./docs").as_deref(), Some("/docs"));
        assert_eq!(normalize_path("//docs//index.html").as_deref(), Some("/docs/index.html"));
        assert_eq!(normalize_path("/docs/.").as_deref(), Some("/docs/"));
        assert_eq!(normalize_path("/").as_deref(), Some("/"));
        assert_eq!(normalize_path("/file%2etxt").as_deref(), Some("/file%2etxt"));
        assert_eq!(normalize_path("/.."), None);
        assert_eq!(normalize_path("/x%2f..%2fdocs"), None);
    }

    #[test]
    fn test_invalid_routes_rejected() {
        assert!(RouteEntry::new("docs", "http://api").is_err());
        assert!(RouteEntry::new("/docs", "ftp://api").is_err());
        assert!(RouteEntry::new("/docs", "not a url").is_err());
        let dup = RouteTable::new(vec![
            RouteEntry::new("/a", "http://x").unwrap(),
            RouteEntry::new("/a", "http://y").unwrap(),
        ]);
        assert!(matches!(dup, Err(GatewayError::InvalidRoute { .. })));
    }

    #[test]
    fn test_allowed_users() {
        let open = RouteEntry::new("/docs", "http://api").unwrap().with_auth(Vec::new());
        assert!(open.allows("anyone"));
        let restricted = RouteEntry::new("/admin", "http://api").unwrap().with_auth(vec!["ops".to_string()]);
        assert!(restricted.allows("ops"));
        assert!(!restricted.allows("viewer"));
    }
}
