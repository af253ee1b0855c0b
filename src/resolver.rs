//! Upstream host resolution.
//!
//! The configured upstream hostname is used as-is unless a host split is
//! declared for it. A split sends requests whose path starts with one of the
//! split's prefixes to an alias host (for example `github.com` →
//! `api.github.com` for REST paths).

use crate::config::HostSplit;
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::{debug, warn};

/// Result of resolving one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Hostname to connect to and to rewrite from.
    pub target: String,
    /// The split entry declared for the base host, if any.
    pub split: Option<HostSplit>,
}

impl Resolution {
    /// Whether the request was routed to the split's alias host.
    pub fn is_alias(&self) -> bool {
        self.split
            .as_ref()
            .is_some_and(|split| split.alias == self.target)
    }

    /// The other host of the split pair, which responses may also mention.
    pub fn sibling(&self) -> Option<&str> {
        let split = self.split.as_ref()?;
        if self.is_alias() {
            Some(split.host.as_str())
        } else {
            Some(split.alias.as_str())
        }
    }
}

/// Declarative table of host splits.
#[derive(Debug, Clone, Default)]
pub struct HostResolver {
    splits: Vec<HostSplit>,
}

impl HostResolver {
    /// Creates a resolver over the given split table.
    pub fn new(splits: Vec<HostSplit>) -> Self {
        Self { splits }
    }

    /// Looks up the split declared for `base`, if any.
    pub fn split_for(&self, base: &str) -> Option<&HostSplit> {
        self.splits.iter().find(|split| split.host == base)
    }

    /// Resolves the upstream host for `path` under the configured `base`.
    ///
    /// Prefix matching is a plain case-sensitive test against the raw path.
    pub fn resolve(&self, base: &str, path: &str) -> Resolution {
        let Some(split) = self.split_for(base) else {
            return Resolution {
                target: base.to_string(),
                split: None,
            };
        };

        let target = match split.matching_prefix(path) {
            Some(prefix) => {
                debug!(base = %base, alias = %split.alias, prefix = %prefix, "Routing to alias host");
                split.alias.clone()
            }
            None => base.to_string(),
        };

        Resolution {
            target,
            split: Some(split.clone()),
        }
    }
}

/// Parses a host:port string, using default port if not specified.
pub fn parse_host_port(host: &str, default_port: u16) -> (String, u16) {
    if host.starts_with('[') {
        // [::1]:8080 or bare [::1]
        if let Some(bracket) = host.find(']') {
            let port = host[bracket + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host[..=bracket].to_string(), port);
        }
        return (host.to_string(), default_port);
    }

    match host.rsplit_once(':') {
        Some((name, port)) => (name.to_string(), port.parse().unwrap_or(default_port)),
        None => (host.to_string(), default_port),
    }
}

/// Resolves `host:port` to a socket address via the system resolver.
pub fn dns_resolve(host: &str, port: u16) -> Option<SocketAddr> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match (bare, port).to_socket_addrs() {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            warn!(host = %host, port = port, error = %e, "DNS resolution failed");
            None
        }
    }
}

/// Strips any port from a `Host`-style value.
pub fn hostname_only(host: &str) -> &str {
    if host.starts_with('[') {
        return host.find(']').map_or(host, |i| &host[..=i]);
    }
    host.rsplit_once(':').map_or(host, |(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn github_split() -> HostSplit {
        HostSplit {
            host: "github.com".to_string(),
            alias: "api.github.com".to_string(),
            path_prefixes: vec!["/repos/".to_string(), "/users/".to_string()],
            user_agent: "test-agent".to_string(),
            accept: "application/vnd.github.v3+json".to_string(),
        }
    }

    #[test]
    fn test_resolve_without_split() {
        let resolver = HostResolver::new(vec![github_split()]);
        let resolution = resolver.resolve("gitlab.com", "/repos/x");
        assert_eq!(resolution.target, "gitlab.com");
        assert!(resolution.split.is_none());
        assert!(!resolution.is_alias());
        assert_eq!(resolution.sibling(), None);
    }

    #[test]
    fn test_resolve_api_path_to_alias() {
        let resolver = HostResolver::new(vec![github_split()]);
        let resolution = resolver.resolve("github.com", "/repos/owner/repo");
        assert_eq!(resolution.target, "api.github.com");
        assert!(resolution.is_alias());
        assert_eq!(resolution.sibling(), Some("github.com"));
    }

    #[test]
    fn test_resolve_web_path_stays_on_base() {
        let resolver = HostResolver::new(vec![github_split()]);
        let resolution = resolver.resolve("github.com", "/owner/repo");
        assert_eq!(resolution.target, "github.com");
        assert!(!resolution.is_alias());
        assert_eq!(resolution.sibling(), Some("api.github.com"));
    }

    #[test]
    fn test_prefix_match_is_case_sensitive() {
        let resolver = HostResolver::new(vec![github_split()]);
        assert_eq!(resolver.resolve("github.com", "/Repos/x").target, "github.com");
        assert_eq!(resolver.resolve("github.com", "/repos").target, "github.com");
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let resolver = HostResolver::new(vec![github_split()]);
        let first = resolver.resolve("github.com", "/users/octocat");
        let second = resolver.resolve("github.com", "/users/octocat");
        assert_eq!(first, second);
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("example.com:8080", 80),
            ("example.com".to_string(), 8080)
        );
        assert_eq!(
            parse_host_port("example.com", 443),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_host_port("[::1]:8080", 80),
            ("[::1]".to_string(), 8080)
        );
        assert_eq!(parse_host_port("[::1]", 80), ("[::1]".to_string(), 80));
    }

    #[test]
    fn test_dns_resolve() {
        assert!(dns_resolve("127.0.0.1", 80).is_some());
        assert_eq!(dns_resolve("[::1]", 8080).map(|a| a.port()), Some(8080));
        assert!(dns_resolve("this.host.definitely.does.not.exist.invalid", 80).is_none());
    }

    #[test]
    fn test_hostname_only() {
        assert_eq!(hostname_only("mirror.test:8443"), "mirror.test");
        assert_eq!(hostname_only("mirror.test"), "mirror.test");
        assert_eq!(hostname_only("[::1]:80"), "[::1]");
    }
}
