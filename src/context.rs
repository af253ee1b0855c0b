//! Per-request rewrite context.

use crate::config::HostSplit;
use crate::resolver::Resolution;

/// Hostnames involved in rewriting one request.
///
/// Built once after the request is accepted and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteContext {
    origin_hostname: String,
    base_hostname: String,
    resolution: Resolution,
}

impl RewriteContext {
    pub fn new(
        origin_hostname: impl Into<String>,
        base_hostname: impl Into<String>,
        resolution: Resolution,
    ) -> Self {
        Self {
            origin_hostname: origin_hostname.into(),
            base_hostname: base_hostname.into(),
            resolution,
        }
    }

    /// Hostname the client connected to.
    pub fn origin_hostname(&self) -> &str {
        &self.origin_hostname
    }

    /// Configured upstream hostname before resolution.
    pub fn base_hostname(&self) -> &str {
        &self.base_hostname
    }

    /// Upstream hostname actually contacted.
    pub fn resolved_hostname(&self) -> &str {
        &self.resolution.target
    }

    /// The other hostname of an active split, if any.
    pub fn sibling_hostname(&self) -> Option<&str> {
        self.resolution.sibling()
    }

    /// The split entry when the request was routed to its alias host.
    pub fn alias_split(&self) -> Option<&HostSplit> {
        if self.resolution.is_alias() {
            self.resolution.split.as_ref()
        } else {
            None
        }
    }
}
