//! Request gating.
//!
//! Decides whether a request is proxied at all, based on the configured
//! hostname, path, user-agent, client IP and client region. Every configured
//! filter must pass; an unset filter imposes no constraint.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use regex::Regex;
use std::fmt;
use tracing::warn;

/// Why a request was not proxied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No upstream hostname is configured.
    MissingHostname,
    /// The path does not match `PATHNAME_REGEX`.
    PathnameMismatch,
    /// The user-agent does not match the allow list.
    UserAgentNotAllowed,
    /// The user-agent matches the deny list.
    UserAgentDenied,
    /// The client IP does not match the allow list.
    IpNotAllowed,
    /// The client IP matches the deny list.
    IpDenied,
    /// The client region does not match the allow list.
    RegionNotAllowed,
    /// The client region matches the deny list.
    RegionDenied,
}

impl Rejection {
    /// Stable label used in log records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingHostname => "missing_hostname",
            Self::PathnameMismatch => "pathname_mismatch",
            Self::UserAgentNotAllowed => "user_agent_not_allowed",
            Self::UserAgentDenied => "user_agent_denied",
            Self::IpNotAllowed => "ip_not_allowed",
            Self::IpDenied => "ip_denied",
            Self::RegionNotAllowed => "region_not_allowed",
            Self::RegionDenied => "region_denied",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject(Rejection),
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// The filter inputs of one incoming request.
///
/// Absent headers are represented as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    /// Request path without the query string.
    pub path: String,
    /// Raw user-agent header value.
    pub user_agent: String,
    /// Client IP address as text.
    pub client_ip: String,
    /// Client region code.
    pub region: String,
    /// Full request URL, for log records.
    pub url: String,
}

/// Precompiled gating rules.
#[derive(Debug, Clone, Default)]
pub struct AccessRules {
    hostname_configured: bool,
    pathname: Option<Regex>,
    ua_allow: Option<Regex>,
    ua_deny: Option<Regex>,
    ip_allow: Option<Regex>,
    ip_deny: Option<Regex>,
    region_allow: Option<Regex>,
    region_deny: Option<Regex>,
}

fn compile(option: &str, pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .map(|p| Regex::new(p).map_err(|e| ProxyError::invalid_pattern(option, e)))
        .transpose()
}

impl AccessRules {
    /// Compiles every configured filter pattern.
    pub fn compile(config: &ProxyConfig) -> Result<Self> {
        Ok(Self {
            hostname_configured: config.hostname.is_some(),
            pathname: compile("PATHNAME_REGEX", config.pathname_regex.as_deref())?,
            ua_allow: compile("UA_WHITELIST_REGEX", config.ua_whitelist_regex.as_deref())?,
            ua_deny: compile("UA_BLACKLIST_REGEX", config.ua_blacklist_regex.as_deref())?,
            ip_allow: compile("IP_WHITELIST_REGEX", config.ip_whitelist_regex.as_deref())?,
            ip_deny: compile("IP_BLACKLIST_REGEX", config.ip_blacklist_regex.as_deref())?,
            region_allow: compile(
                "REGION_WHITELIST_REGEX",
                config.region_whitelist_regex.as_deref(),
            )?,
            region_deny: compile(
                "REGION_BLACKLIST_REGEX",
                config.region_blacklist_regex.as_deref(),
            )?,
        })
    }

    /// Evaluates the rules in order and returns the first failure.
    pub fn evaluate(&self, req: &RequestInfo) -> Decision {
        match self.first_failure(req) {
            None => Decision::Accept,
            Some(reason) => Decision::Reject(reason),
        }
    }

    /// Same as [`evaluate`](Self::evaluate), logging rejections.
    pub fn check(&self, req: &RequestInfo) -> Decision {
        let decision = self.evaluate(req);
        if let Decision::Reject(reason) = decision {
            warn!(
                client_ip = %req.client_ip,
                user_agent = %req.user_agent,
                url = %req.url,
                reason = %reason,
                "Request rejected"
            );
        }
        decision
    }

    fn first_failure(&self, req: &RequestInfo) -> Option<Rejection> {
        if !self.hostname_configured {
            return Some(Rejection::MissingHostname);
        }
        if let Some(re) = &self.pathname {
            if !re.is_match(&req.path) {
                return Some(Rejection::PathnameMismatch);
            }
        }

        let user_agent = req.user_agent.to_lowercase();
        let checks = [
            (&self.ua_allow, &self.ua_deny, user_agent.as_str(), Rejection::UserAgentNotAllowed, Rejection::UserAgentDenied),
            (&self.ip_allow, &self.ip_deny, req.client_ip.as_str(), Rejection::IpNotAllowed, Rejection::IpDenied),
            (&self.region_allow, &self.region_deny, req.region.as_str(), Rejection::RegionNotAllowed, Rejection::RegionDenied),
        ];
        for (allow, deny, value, not_allowed, denied) in checks {
            if allow.as_ref().is_some_and(|re| !re.is_match(value)) {
                return Some(not_allowed);
            }
            if deny.as_ref().is_some_and(|re| re.is_match(value)) {
                return Some(denied);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ProxyConfig {
        ProxyConfig {
            hostname: Some("github.com".to_string()),
            ..Default::default()
        }
    }

    fn request() -> RequestInfo {
        RequestInfo {
            path: "/owner/repo".to_string(),
            user_agent: "Mozilla/5.0 (X11; Linux)".to_string(),
            client_ip: "203.0.113.7".to_string(),
            region: "NL".to_string(),
            url: "https://mirror.test/owner/repo".to_string(),
        }
    }

    #[test]
    fn test_missing_hostname_always_rejects() {
        let rules = AccessRules::compile(&ProxyConfig::default()).unwrap();
        assert_eq!(
            rules.evaluate(&request()),
            Decision::Reject(Rejection::MissingHostname)
        );
    }

    #[test]
    fn test_no_filters_accepts() {
        let rules = AccessRules::compile(&base_config()).unwrap();
        assert!(rules.evaluate(&request()).is_accept());
        assert!(rules.evaluate(&RequestInfo::default()).is_accept());
    }

    #[test]
    fn test_pathname_filter() {
        let config = ProxyConfig {
            pathname_regex: Some("^/owner/".to_string()),
            ..base_config()
        };
        let rules = AccessRules::compile(&config).unwrap();
        assert!(rules.evaluate(&request()).is_accept());

        let req = RequestInfo {
            path: "/other/repo".to_string(),
            ..request()
        };
        assert_eq!(
            rules.evaluate(&req),
            Decision::Reject(Rejection::PathnameMismatch)
        );
    }

    #[test]
    fn test_user_agent_is_lowercased() {
        let config = ProxyConfig {
            ua_whitelist_regex: Some("mozilla".to_string()),
            ua_blacklist_regex: Some("linux".to_string()),
            ..base_config()
        };
        let rules = AccessRules::compile(&config).unwrap();
        assert_eq!(
            rules.evaluate(&request()),
            Decision::Reject(Rejection::UserAgentDenied)
        );

        let req = RequestInfo {
            user_agent: "Mozilla/5.0 (Windows NT 10.0)".to_string(),
            ..request()
        };
        assert!(rules.evaluate(&req).is_accept());
    }

    #[test]
    fn test_missing_user_agent_is_empty_string() {
        let allow = ProxyConfig {
            ua_whitelist_regex: Some("curl".to_string()),
            ..base_config()
        };
        let deny = ProxyConfig {
            ua_blacklist_regex: Some("curl".to_string()),
            ..base_config()
        };
        let req = RequestInfo {
            user_agent: String::new(),
            ..request()
        };

        let rules = AccessRules::compile(&allow).unwrap();
        assert_eq!(
            rules.evaluate(&req),
            Decision::Reject(Rejection::UserAgentNotAllowed)
        );
        let rules = AccessRules::compile(&deny).unwrap();
        assert!(rules.evaluate(&req).is_accept());
    }

    #[test]
    fn test_ip_filters() {
        let config = ProxyConfig {
            ip_whitelist_regex: Some(r"^203\.0\.113\.".to_string()),
            ip_blacklist_regex: Some(r"^203\.0\.113\.66$".to_string()),
            ..base_config()
        };
        let rules = AccessRules::compile(&config).unwrap();
        assert!(rules.evaluate(&request()).is_accept());

        let denied = RequestInfo {
            client_ip: "203.0.113.66".to_string(),
            ..request()
        };
        assert_eq!(rules.evaluate(&denied), Decision::Reject(Rejection::IpDenied));

        let outside = RequestInfo {
            client_ip: "198.51.100.1".to_string(),
            ..request()
        };
        assert_eq!(
            rules.evaluate(&outside),
            Decision::Reject(Rejection::IpNotAllowed)
        );
    }

    #[test]
    fn test_region_filters() {
        let config = ProxyConfig {
            region_whitelist_regex: Some("^(NL|BE)$".to_string()),
            region_blacklist_regex: Some("^BE$".to_string()),
            ..base_config()
        };
        let rules = AccessRules::compile(&config).unwrap();
        assert!(rules.evaluate(&request()).is_accept());

        let be = RequestInfo {
            region: "BE".to_string(),
            ..request()
        };
        assert_eq!(rules.evaluate(&be), Decision::Reject(Rejection::RegionDenied));

        let none = RequestInfo {
            region: String::new(),
            ..request()
        };
        assert_eq!(
            rules.evaluate(&none),
            Decision::Reject(Rejection::RegionNotAllowed)
        );
    }

    #[test]
    fn test_invalid_pattern_names_option() {
        let config = ProxyConfig {
            ip_blacklist_regex: Some("([".to_string()),
            ..base_config()
        };
        let err = AccessRules::compile(&config).unwrap_err();
        assert!(err.to_string().contains("IP_BLACKLIST_REGEX"));
    }

    #[test]
    fn test_rejection_labels() {
        assert_eq!(Rejection::MissingHostname.to_string(), "missing_hostname");
        assert_eq!(Rejection::RegionDenied.as_str(), "region_denied");
    }
}
